//! Linear storage buffer for card data.
//!
//! One contiguous byte arena backs every card buffer. When streaming is
//! enabled the backing store is a [`SharedMemoryRegion`] and remote writers
//! mutate allocations directly; otherwise a process-private vector with the
//! identical layout plays that role. Either way the first
//! [`REGION_HEADER_SIZE`] bytes hold the region header and every allocation
//! is framed by a 16-byte seqlock [`AllocationHeader`] followed by payload.
//!
//! The per-frame contract is the reservation protocol: cards declare their
//! totals through [`reserve`](BufferManager::reserve) (Loop 1),
//! [`commit_reservations`](BufferManager::commit_reservations) grows the
//! backing store once if needed, and the
//! [`allocate`](BufferManager::allocate) calls of Loop 2 then never resize,
//! so payload offsets stay stable for the whole frame. Allocation is a bump
//! pointer restarted every frame; as long as cards allocate in a stable
//! order an unchanged card set reproduces identical offsets, which is what
//! keeps remote writers' handles valid across frames.

use rustc_hash::FxHashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::seqlock::{AllocationHeader, ALLOCATION_HEADER_SIZE, READ_SPIN_TIMEOUT};
use crate::shm::{SharedMemoryRegion, REGION_HEADER_SIZE};

/// Allocation alignment inside the arena (also the header size).
const ALIGN: u32 = 16;

/// Growth factor applied when reservations exceed capacity.
const GROWTH_NUM: u64 = 3;
const GROWTH_DEN: u64 = 2;

/// Handle to a card buffer: payload range within the arena. The allocation's
/// seqlock header sits at `offset - 16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub offset: u32,
    pub size: u32,
}

impl BufferHandle {
    pub const INVALID: BufferHandle = BufferHandle { offset: 0, size: 0 };

    pub fn is_valid(&self) -> bool {
        self.size > 0
    }

    /// Offset of the allocation's seqlock header.
    pub fn header_offset(&self) -> u32 {
        self.offset - ALLOCATION_HEADER_SIZE as u32
    }
}

/// One row of the buffer table served to RPC diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub slot_index: u32,
    pub scope: String,
    /// Header offset, as handed to streaming clients.
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Allocation {
    handle: BufferHandle,
}

enum Backing {
    Shm(SharedMemoryRegion),
    Private(Vec<u8>),
}

impl Backing {
    fn base(&mut self) -> *mut u8 {
        match self {
            Backing::Shm(region) => region.data(),
            Backing::Private(vec) => vec.as_mut_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Shm(region) => region.size(),
            Backing::Private(vec) => vec.len(),
        }
    }
}

/// Manager for the linear storage buffer (bind group binding 2).
pub struct BufferManager {
    backing: Backing,
    /// Bytes reserved by cards during the current Loop 1.
    pending: u32,
    /// Bump cursor within the data area, restarted each frame.
    bump: u32,
    /// Live allocations by (slot, scope); survives frames for stability
    /// checks and RPC lookups.
    allocations: FxHashMap<(u32, String), Allocation>,
    /// Allocation keys touched this frame, in allocation order.
    frame_order: Vec<(u32, String)>,
    high_water: u32,
    /// Set when the backing store grew; the GPU buffer must be recreated and
    /// the bind group rebuilt before the next draw.
    recreated: bool,
}

impl BufferManager {
    /// Streaming-enabled manager over a shared region.
    pub fn with_shm(region: SharedMemoryRegion) -> Result<Self> {
        if !region.is_owner() {
            return Err(Error::InvalidArgument(
                "buffer manager requires the owning side of the region".into(),
            ));
        }
        Ok(Self::new(Backing::Shm(region)))
    }

    /// Streaming-disabled manager over a private arena of `size` bytes.
    pub fn private(size: usize) -> Self {
        Self::new(Backing::Private(vec![0; size.max(REGION_HEADER_SIZE * 2)]))
    }

    fn new(backing: Backing) -> Self {
        Self {
            backing,
            pending: 0,
            bump: 0,
            allocations: FxHashMap::default(),
            frame_order: Vec::new(),
            high_water: 0,
            recreated: false,
        }
    }

    /// Data-area capacity (arena bytes minus the region header).
    pub fn capacity(&self) -> u32 {
        (self.backing.len() - REGION_HEADER_SIZE) as u32
    }

    pub fn uses_shared_memory(&self) -> bool {
        matches!(self.backing, Backing::Shm(_))
    }

    /// Region name and total size for `stream_connect`.
    pub fn shm_info(&self) -> Option<(String, u64)> {
        match &self.backing {
            Backing::Shm(region) => Some((region.name().to_string(), region.size() as u64)),
            Backing::Private(_) => None,
        }
    }

    // =========================================================================
    // Loop 1 — reservation
    // =========================================================================

    /// Restart the frame: reservations accumulate from zero.
    pub fn begin_frame(&mut self) {
        self.pending = 0;
    }

    /// Declare `size` payload bytes of need (Loop 1). Framing overhead is
    /// accounted here so Loop 2 can never outgrow the commitment.
    pub fn reserve(&mut self, size: u32) {
        self.pending = self.pending.saturating_add(framed(size));
    }

    /// Grow the backing store once so that every reserved allocation fits
    /// (run between Loop 1 and Loop 2).
    pub fn commit_reservations(&mut self) -> Result<()> {
        if self.pending > self.capacity() {
            let grown = (self.backing.len() as u64 * GROWTH_NUM / GROWTH_DEN)
                .max(REGION_HEADER_SIZE as u64 + self.pending as u64);
            let new_size = (grown as usize + ALIGN as usize - 1) & !(ALIGN as usize - 1);
            match &mut self.backing {
                Backing::Shm(region) => region.grow(new_size)?,
                Backing::Private(vec) => vec.resize(new_size, 0),
            }
            info!(new_size, pending = self.pending, "grew card storage buffer");
            self.recreated = true;
        }
        self.bump = 0;
        self.frame_order.clear();
        Ok(())
    }

    // =========================================================================
    // Loop 2 — allocation
    // =========================================================================

    /// Allocate the buffer for `(slot, scope)` this frame (Loop 2).
    ///
    /// An unreserved allocation still proceeds, but once the bump cursor
    /// would overrun the arena the call fails with `OutOfSpace` and the card
    /// must treat its handles as invalid until the next frame.
    pub fn allocate(&mut self, slot_index: u32, scope: &str, size: u32) -> Result<BufferHandle> {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero-size buffer for slot {slot_index} scope '{scope}'"
            )));
        }
        let need = framed(size);
        let end = self.bump.checked_add(need).filter(|end| *end <= self.capacity());
        if end.is_none() {
            return Err(Error::OutOfSpace(format!(
                "slot {slot_index} scope '{scope}': {need} B past committed reservation"
            )));
        }

        let header_offset = REGION_HEADER_SIZE as u32 + self.bump;
        self.bump += need;
        self.high_water = self.high_water.max(self.bump);

        let handle = BufferHandle {
            offset: header_offset + ALLOCATION_HEADER_SIZE as u32,
            size,
        };

        let key = (slot_index, scope.to_string());
        let unchanged = self.allocations.get(&key).map(|a| a.handle) == Some(handle);
        // Same placement as last frame: leave the header alone entirely, a
        // remote writer may be mid-write right now.
        if !unchanged {
            unsafe { AllocationHeader::init(self.ptr_at(header_offset), size) };
            debug!(slot_index, scope, offset = handle.offset, size, "buffer allocated");
            self.allocations.insert(key.clone(), Allocation { handle });
        }
        self.frame_order.push(key);
        Ok(handle)
    }

    /// Drop every allocation belonging to `slot` (card disposal). The bytes
    /// are not compacted; the space returns at the next frame's re-reserve.
    pub fn release_slot(&mut self, slot_index: u32) {
        self.allocations.retain(|(slot, _), _| *slot != slot_index);
        self.frame_order.retain(|(slot, _)| *slot != slot_index);
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Terminal-side write into a card's payload. Single-threaded with the
    /// flush, so no seqlock bracket is needed on this side.
    pub fn write_payload(&mut self, handle: BufferHandle, offset: u32, bytes: &[u8]) -> Result<()> {
        if !handle.is_valid() {
            return Err(Error::InvalidArgument("invalid buffer handle".into()));
        }
        let in_bounds = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .is_some_and(|end| end <= handle.size);
        if !in_bounds {
            return Err(Error::InvalidArgument(format!(
                "write of {} B at +{offset} exceeds {} B allocation",
                bytes.len(),
                handle.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr_at(handle.offset + offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy of a payload as seen right now (tests, diagnostics).
    pub fn read_payload(&mut self, handle: BufferHandle) -> Vec<u8> {
        let mut out = vec![0; handle.size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr_at(handle.offset),
                out.as_mut_ptr(),
                handle.size as usize,
            );
        }
        out
    }

    /// Lookup for `stream_get_buffer`: the allocation's header offset and
    /// payload size, or `None` if the card has not allocated this scope yet.
    pub fn lookup(&self, slot_index: u32, scope: &str) -> Option<(u32, u32)> {
        self.allocations
            .get(&(slot_index, scope.to_string()))
            .map(|a| (a.handle.header_offset(), a.handle.size))
    }

    /// All live allocations for `buffers_list`.
    pub fn all_buffers(&self) -> Vec<BufferInfo> {
        let mut rows: Vec<BufferInfo> = self
            .allocations
            .iter()
            .map(|((slot, scope), a)| BufferInfo {
                slot_index: *slot,
                scope: scope.clone(),
                offset: a.handle.header_offset(),
                size: a.handle.size,
            })
            .collect();
        rows.sort_by(|a, b| (a.slot_index, &a.scope).cmp(&(b.slot_index, &b.scope)));
        rows
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Walk this frame's allocations in order, snapshotting each payload
    /// under its seqlock read bracket and handing it to `upload` together
    /// with its payload offset. Returns how many allocations were skipped
    /// because a writer held them past the spin bound (their stale bytes
    /// simply persist on the GPU for a frame).
    pub fn flush_uploads<F>(&mut self, mut upload: F) -> u32
    where
        F: FnMut(u32, &[u8]),
    {
        self.flush_uploads_with_timeout(READ_SPIN_TIMEOUT, &mut upload)
    }

    pub fn flush_uploads_with_timeout<F>(&mut self, timeout: Duration, upload: &mut F) -> u32
    where
        F: FnMut(u32, &[u8]),
    {
        let mut skipped = 0;
        let keys: Vec<(u32, String)> = self.frame_order.clone();
        for key in keys {
            let Some(alloc) = self.allocations.get(&key) else {
                continue;
            };
            let handle = alloc.handle;
            let header = unsafe { AllocationHeader::from_raw(self.ptr_at(handle.header_offset())) };
            match header.begin_read(timeout) {
                Some(guard) => upload(handle.offset, guard.payload()),
                None => {
                    warn!(
                        slot = key.0,
                        scope = %key.1,
                        "writer stuck mid-write, skipping upload this frame"
                    );
                    skipped += 1;
                }
            }
        }
        skipped
    }

    /// Whether the backing store grew since the last call; the GPU buffer
    /// must be recreated at [`gpu_buffer_size`](Self::gpu_buffer_size) and
    /// the bind group rebuilt.
    pub fn take_recreated(&mut self) -> bool {
        std::mem::take(&mut self.recreated)
    }

    /// Size the GPU-side buffer must have: the whole arena, so payload
    /// offsets are shared verbatim between shm, CPU and shader views.
    pub fn gpu_buffer_size(&self) -> usize {
        self.backing.len()
    }

    pub fn high_water_mark(&self) -> u32 {
        self.high_water
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            used: self.bump,
            capacity: self.capacity(),
            allocations: self.allocations.len() as u32,
        }
    }

    fn ptr_at(&mut self, offset: u32) -> *mut u8 {
        debug_assert!((offset as usize) < self.backing.len());
        unsafe { self.backing.base().add(offset as usize) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub used: u32,
    pub capacity: u32,
    pub allocations: u32,
}

/// Aligned footprint of a payload plus its header.
fn framed(size: u32) -> u32 {
    (ALLOCATION_HEADER_SIZE as u32)
        .saturating_add(size)
        .saturating_add(ALIGN - 1)
        & !(ALIGN - 1)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn frame(mgr: &mut BufferManager, reserves: &[u32]) {
        mgr.begin_frame();
        for r in reserves {
            mgr.reserve(*r);
        }
        mgr.commit_reservations().unwrap();
    }

    #[test]
    fn reserve_then_allocate_is_stable_across_frames() {
        let mut mgr = BufferManager::private(4096);

        frame(&mut mgr, &[1600]);
        let first = mgr.allocate(3, "waveform", 1600).unwrap();

        frame(&mut mgr, &[1600]);
        let second = mgr.allocate(3, "waveform", 1600).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.offset % 16, 0);
        assert_eq!(first.header_offset() + 16, first.offset);
    }

    #[test]
    fn allocations_never_overlap_within_a_frame() {
        let mut mgr = BufferManager::private(8192);
        frame(&mut mgr, &[100, 200, 300]);
        let a = mgr.allocate(0, "prims", 100).unwrap();
        let b = mgr.allocate(1, "prims", 200).unwrap();
        let c = mgr.allocate(1, "derived", 300).unwrap();
        for (x, y) in [(a, b), (a, c), (b, c)] {
            assert!(
                x.header_offset() + framed(x.size) <= y.header_offset()
                    || y.header_offset() + framed(y.size) <= x.header_offset()
            );
        }
    }

    #[test]
    fn commit_grows_private_backing() {
        let mut mgr = BufferManager::private(1024);
        let before = mgr.capacity();
        frame(&mut mgr, &[8 * 1024 * 1024]);
        assert!(mgr.capacity() >= 8 * 1024 * 1024);
        assert!(mgr.capacity() > before);
        assert!(mgr.take_recreated());
        assert!(!mgr.take_recreated());
        mgr.allocate(0, "data", 8 * 1024 * 1024).unwrap();
    }

    #[test]
    fn unreserved_allocation_overrun_is_out_of_space() {
        let mut mgr = BufferManager::private(1024);
        frame(&mut mgr, &[]);
        // No reservation: small allocation still fits the existing arena...
        mgr.allocate(0, "small", 64).unwrap();
        // ...but an overrun fails instead of resizing mid-frame.
        assert!(matches!(
            mgr.allocate(1, "big", 64 * 1024),
            Err(Error::OutOfSpace(_))
        ));
    }

    #[test]
    fn lookup_returns_header_offset() {
        let mut mgr = BufferManager::private(4096);
        frame(&mut mgr, &[400]);
        let handle = mgr.allocate(7, "waveform", 400).unwrap();
        assert_eq!(mgr.lookup(7, "waveform"), Some((handle.offset - 16, 400)));
        assert_eq!(mgr.lookup(7, "other"), None);
        assert_eq!(mgr.lookup(8, "waveform"), None);
    }

    #[test]
    fn release_slot_forgets_allocations() {
        let mut mgr = BufferManager::private(4096);
        frame(&mut mgr, &[64, 64]);
        mgr.allocate(1, "a", 64).unwrap();
        mgr.allocate(2, "b", 64).unwrap();
        mgr.release_slot(1);
        assert_eq!(mgr.lookup(1, "a"), None);
        assert_eq!(mgr.all_buffers().len(), 1);
    }

    #[test]
    fn flush_visits_allocations_with_payload_offsets() {
        let mut mgr = BufferManager::private(4096);
        frame(&mut mgr, &[32, 48]);
        let a = mgr.allocate(0, "a", 32).unwrap();
        let b = mgr.allocate(1, "b", 48).unwrap();
        mgr.write_payload(a, 0, &[0xAA; 32]).unwrap();
        mgr.write_payload(b, 0, &[0xBB; 48]).unwrap();

        let mut seen = Vec::new();
        let skipped = mgr.flush_uploads(|offset, bytes| {
            seen.push((offset, bytes.to_vec()));
        });
        assert_eq!(skipped, 0);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (a.offset, vec![0xAA; 32]));
        assert_eq!(seen[1], (b.offset, vec![0xBB; 48]));
    }

    #[test]
    fn shm_backing_reports_stream_info() {
        let name = format!("yetty-test-bufmgr-{}", std::process::id());
        let region = SharedMemoryRegion::create(&name, 1 << 20).unwrap();
        let mut mgr = BufferManager::with_shm(region).unwrap();
        let (shm_name, shm_size) = mgr.shm_info().unwrap();
        assert_eq!(shm_name, name);
        assert_eq!(shm_size, 1 << 20);
        assert!(mgr.uses_shared_memory());

        frame(&mut mgr, &[1600]);
        let handle = mgr.allocate(0, "waveform", 1600).unwrap();
        mgr.write_payload(handle, 0, &[1; 1600]).unwrap();
        assert_eq!(mgr.read_payload(handle), vec![1; 1600]);
    }
}
