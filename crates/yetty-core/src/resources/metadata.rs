//! Card metadata buffer with fixed-class pool allocation.
//!
//! Metadata records are small per-card GPU structs read by the card shaders.
//! Allocation comes from fixed size classes {32, 64, 128, 256}; the smallest
//! class that fits is chosen, its freelist consulted first, then its bump
//! pointer. Handles are stable for the card's lifetime and freed slots are
//! reused (unlike the linear storage buffer, which is re-reserved per frame).

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Error, Result};

/// Available metadata size classes, in bytes.
pub const METADATA_CLASSES: [u32; 4] = [32, 64, 128, 256];

/// Handle into the metadata buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHandle {
    pub offset: u32,
    pub size: u32,
}

impl MetadataHandle {
    pub const INVALID: MetadataHandle = MetadataHandle { offset: 0, size: 0 };

    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Pool sizing, in entries per class.
#[derive(Debug, Clone, Copy)]
pub struct MetadataConfig {
    pub pool32: u32,
    pub pool64: u32,
    pub pool128: u32,
    pub pool256: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            pool32: 0,
            pool64: 1024,
            pool128: 16,
            pool256: 8,
        }
    }
}

impl MetadataConfig {
    fn counts(&self) -> [u32; 4] {
        [self.pool32, self.pool64, self.pool128, self.pool256]
    }
}

struct Pool {
    class_size: u32,
    base: u32,
    capacity: u32,
    bump: u32,
    freelist: Vec<u32>,
}

/// CPU-side metadata buffer plus pool bookkeeping and dirty-range tracking.
pub struct MetadataManager {
    pools: [Pool; 4],
    data: Vec<u8>,
    dirty: SmallVec<[(u32, u32); 16]>,
}

impl MetadataManager {
    pub fn new(config: MetadataConfig) -> Self {
        let counts = config.counts();
        let mut base = 0u32;
        let pools = std::array::from_fn(|i| {
            let pool = Pool {
                class_size: METADATA_CLASSES[i],
                base,
                capacity: counts[i],
                bump: 0,
                freelist: Vec::new(),
            };
            base += METADATA_CLASSES[i] * counts[i];
            pool
        });
        Self {
            pools,
            data: vec![0; base as usize],
            dirty: SmallVec::new(),
        }
    }

    /// Total buffer size in bytes (the GPU-side buffer is created at this
    /// size once and never grows).
    pub fn buffer_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Allocate from the smallest class that fits `size`.
    pub fn allocate(&mut self, size: u32) -> Result<MetadataHandle> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size metadata".into()));
        }
        let pool = self
            .pools
            .iter_mut()
            .find(|p| p.class_size >= size && (p.bump < p.capacity || !p.freelist.is_empty()))
            .ok_or_else(|| Error::OutOfSpace(format!("metadata pools exhausted for {size} B")))?;

        let offset = match pool.freelist.pop() {
            Some(offset) => offset,
            None => {
                let offset = pool.base + pool.bump * pool.class_size;
                pool.bump += 1;
                offset
            }
        };
        trace!(offset, class = pool.class_size, "metadata allocate");
        Ok(MetadataHandle {
            offset,
            size: pool.class_size,
        })
    }

    /// Return a handle's slot to its class freelist. The bytes are not
    /// cleared; the next user overwrites them.
    pub fn deallocate(&mut self, handle: MetadataHandle) -> Result<()> {
        if !handle.is_valid() {
            return Ok(());
        }
        let pool = self
            .pools
            .iter_mut()
            .find(|p| p.class_size == handle.size)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no metadata class of {} B", handle.size))
            })?;
        pool.freelist.push(handle.offset);
        trace!(offset = handle.offset, class = pool.class_size, "metadata free");
        Ok(())
    }

    /// Overwrite a handle's record from its start.
    pub fn write(&mut self, handle: MetadataHandle, bytes: &[u8]) -> Result<()> {
        self.write_at(handle, 0, bytes)
    }

    /// Overwrite part of a handle's record.
    pub fn write_at(&mut self, handle: MetadataHandle, offset: u32, bytes: &[u8]) -> Result<()> {
        if !handle.is_valid() {
            return Err(Error::InvalidArgument("invalid metadata handle".into()));
        }
        let end = offset
            .checked_add(bytes.len() as u32)
            .filter(|end| *end <= handle.size)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "metadata write of {} B at +{offset} exceeds {} B record",
                    bytes.len(),
                    handle.size
                ))
            })?;
        let start = handle.offset + offset;
        self.data[start as usize..(handle.offset + end) as usize].copy_from_slice(bytes);
        self.mark_dirty(start, handle.offset + end);
        Ok(())
    }

    fn mark_dirty(&mut self, start: u32, end: u32) {
        // Merge with an adjacent or overlapping range if one exists.
        for range in &mut self.dirty {
            if start <= range.1 && end >= range.0 {
                range.0 = range.0.min(start);
                range.1 = range.1.max(end);
                return;
            }
        }
        self.dirty.push((start, end));
    }

    /// Drain the coalesced dirty ranges for this frame's upload.
    pub fn take_dirty(&mut self) -> SmallVec<[(u32, u32); 16]> {
        let mut ranges = std::mem::take(&mut self.dirty);
        ranges.sort_unstable();
        // Ranges may have become adjacent since their insertion merge.
        let mut merged: SmallVec<[(u32, u32); 16]> = SmallVec::new();
        for (start, end) in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_fitting_class() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        assert_eq!(mgr.allocate(16).unwrap().size, 64); // pool32 is empty by default
        assert_eq!(mgr.allocate(64).unwrap().size, 64);
        assert_eq!(mgr.allocate(65).unwrap().size, 128);
        assert_eq!(mgr.allocate(256).unwrap().size, 256);
        assert!(matches!(mgr.allocate(257), Err(Error::OutOfSpace(_))));
    }

    #[test]
    fn handles_do_not_overlap() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        let a = mgr.allocate(64).unwrap();
        let b = mgr.allocate(64).unwrap();
        assert!(a.offset + a.size <= b.offset || b.offset + b.size <= a.offset);
    }

    #[test]
    fn freelist_reuses_offsets() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        let a = mgr.allocate(64).unwrap();
        let b = mgr.allocate(64).unwrap();
        mgr.deallocate(a).unwrap();
        let c = mgr.allocate(48).unwrap();
        assert_eq!(c.offset, a.offset);
        assert_ne!(c.offset, b.offset);
    }

    #[test]
    fn pool_exhaustion_is_out_of_space() {
        let mut mgr = MetadataManager::new(MetadataConfig {
            pool32: 0,
            pool64: 2,
            pool128: 0,
            pool256: 0,
        });
        mgr.allocate(64).unwrap();
        mgr.allocate(64).unwrap();
        assert!(matches!(mgr.allocate(64), Err(Error::OutOfSpace(_))));
    }

    #[test]
    fn writes_land_and_mark_dirty() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        let h = mgr.allocate(64).unwrap();
        mgr.write(h, &[1, 2, 3, 4]).unwrap();
        mgr.write_at(h, 8, &[9]).unwrap();

        assert_eq!(&mgr.data()[h.offset as usize..h.offset as usize + 4], &[1, 2, 3, 4]);
        assert_eq!(mgr.data()[h.offset as usize + 8], 9);

        let dirty = mgr.take_dirty();
        assert_eq!(dirty.len(), 2);
        assert!(!mgr.has_dirty());
    }

    #[test]
    fn adjacent_dirty_ranges_coalesce() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        let h = mgr.allocate(64).unwrap();
        mgr.write_at(h, 0, &[0; 8]).unwrap();
        mgr.write_at(h, 8, &[0; 8]).unwrap();
        let dirty = mgr.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0], (h.offset, h.offset + 16));
    }

    #[test]
    fn write_past_record_is_rejected() {
        let mut mgr = MetadataManager::new(MetadataConfig::default());
        let h = mgr.allocate(32).unwrap(); // lands in the 64 B class
        assert!(mgr.write_at(h, 60, &[0; 8]).is_err());
        assert!(mgr.write(MetadataHandle::INVALID, &[0]).is_err());
    }
}
