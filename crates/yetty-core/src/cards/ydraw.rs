//! YDraw card: GPU-evaluated vector primitives from a streamed buffer.
//!
//! Primitives are packed 16-byte records the shader walks per fragment; the
//! card only manages the `prims` buffer they stream through.

use tracing::debug;

use super::{kind, tokenize_args, CardCommon};
use crate::error::Result;
use crate::resources::{BufferHandle, CardResourceManager};

/// Bytes per primitive record (4 floats).
const PRIM_STRIDE: u32 = 16;
const DEFAULT_PRIMS: u32 = 256;

#[derive(Debug)]
pub struct YDrawCard {
    pub common: CardCommon,
    prim_capacity: u32,
    handle: BufferHandle,
    seed: Option<Vec<u8>>,
}

impl YDrawCard {
    pub fn create(
        res: &mut CardResourceManager,
        slot: u32,
        x: i32,
        y: i32,
        width_cells: u32,
        height_cells: u32,
        args: &str,
        payload: &[u8],
    ) -> Result<Self> {
        let common = CardCommon::new(res, slot, x, y, width_cells, height_cells)?;
        let prim_capacity = parse_prims(args).unwrap_or(DEFAULT_PRIMS);
        debug!(slot, prim_capacity, "ydraw card created");
        Ok(Self {
            common,
            prim_capacity,
            handle: BufferHandle::INVALID,
            seed: (!payload.is_empty()).then(|| payload.to_vec()),
        })
    }

    pub fn declare_buffer_needs(&mut self, res: &mut CardResourceManager) {
        res.buffers_mut().reserve(self.prim_capacity * PRIM_STRIDE);
    }

    pub fn allocate_buffers(&mut self, res: &mut CardResourceManager) -> Result<()> {
        self.handle =
            res.buffers_mut()
                .allocate(self.common.slot, "prims", self.prim_capacity * PRIM_STRIDE)?;
        if let Some(seed) = self.seed.take() {
            let len = seed.len().min(self.handle.size as usize);
            res.buffers_mut().write_payload(self.handle, 0, &seed[..len])?;
        }
        Ok(())
    }

    pub fn render(&mut self, _time: f64, res: &mut CardResourceManager) -> Result<()> {
        let mut record = self.common.meta_record(kind::YDRAW);
        record.buffer_offset = self.handle.offset;
        record.buffer_len = self.handle.size;
        self.common.write_meta(res, &record)
    }

    pub fn update(&mut self, args: &str, payload: &[u8]) -> Result<()> {
        if let Some(prims) = parse_prims(args) {
            self.prim_capacity = prims;
            self.handle = BufferHandle::INVALID;
        }
        if !payload.is_empty() {
            self.seed = Some(payload.to_vec());
        }
        Ok(())
    }

    pub fn buffer(&self) -> BufferHandle {
        self.handle
    }

    pub fn help() -> &'static str {
        "ydraw: GPU vector drawing from a primitive buffer\n\
         \n\
         card args:\n\
         \x20 --prims <count>   primitive capacity (default 256, 16 B each)\n\
         \n\
         payload: optional initial primitive records, streamed thereafter\n\
         via the 'prims' scope"
    }
}

pub(super) fn parse_prims(args: &str) -> Option<u32> {
    let tokens = tokenize_args(args);
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "--prims" {
            return tokens
                .get(i + 1)?
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .map(|n| n.min(super::MAX_BUFFER_FLOATS / 4));
        }
        i += 1;
    }
    None
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceConfig;

    #[test]
    fn prims_capacity_sizes_the_buffer() {
        let mut res = CardResourceManager::private(1 << 16, ResourceConfig::default());
        let slot = res.allocate_slot().unwrap();
        let mut card =
            YDrawCard::create(&mut res, slot, 0, 0, 20, 10, "--prims 64", &[]).unwrap();

        res.buffers_mut().begin_frame();
        card.declare_buffer_needs(&mut res);
        res.commit_reservations().unwrap();
        card.allocate_buffers(&mut res).unwrap();

        assert_eq!(card.buffer().size, 64 * 16);
        assert_eq!(
            res.buffers().lookup(slot, "prims"),
            Some((card.buffer().offset - 16, 64 * 16))
        );
    }

    #[test]
    fn default_capacity_when_unspecified() {
        let mut res = CardResourceManager::private(1 << 16, ResourceConfig::default());
        let slot = res.allocate_slot().unwrap();
        let mut card = YDrawCard::create(&mut res, slot, 0, 0, 20, 10, "", &[]).unwrap();
        res.buffers_mut().begin_frame();
        card.declare_buffer_needs(&mut res);
        res.commit_reservations().unwrap();
        card.allocate_buffers(&mut res).unwrap();
        assert_eq!(card.buffer().size, 256 * 16);
    }
}
