//! HDraw card: hierarchical drawing with a derived-geometry pass.
//!
//! Two scopes: `prims` is streamed by the client exactly as for ydraw,
//! `derived` is the flattened form a compute pass expands into. Both live in
//! the storage arena so the expansion never leaves the GPU.

use tracing::debug;

use super::ydraw::parse_prims;
use super::{kind, CardCommon};
use crate::error::Result;
use crate::resources::{BufferHandle, CardResourceManager};

const PRIM_STRIDE: u32 = 16;
/// Expansion budget: flattened records per source primitive.
const DERIVED_FACTOR: u32 = 4;
const DEFAULT_PRIMS: u32 = 256;

#[derive(Debug)]
pub struct HDrawCard {
    pub common: CardCommon,
    prim_capacity: u32,
    prims: BufferHandle,
    derived: BufferHandle,
    seed: Option<Vec<u8>>,
}

impl HDrawCard {
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
        debug!(slot, prim_capacity, "hdraw card created");
        Ok(Self {
            common,
            prim_capacity,
            prims: BufferHandle::INVALID,
            derived: BufferHandle::INVALID,
            seed: (!payload.is_empty()).then(|| payload.to_vec()),
        })
    }

    pub fn declare_buffer_needs(&mut self, res: &mut CardResourceManager) {
        let prim_bytes = self.prim_capacity * PRIM_STRIDE;
        res.buffers_mut().reserve(prim_bytes);
        res.buffers_mut().reserve(prim_bytes * DERIVED_FACTOR);
    }

    pub fn allocate_buffers(&mut self, res: &mut CardResourceManager) -> Result<()> {
        let prim_bytes = self.prim_capacity * PRIM_STRIDE;
        self.prims = res
            .buffers_mut()
            .allocate(self.common.slot, "prims", prim_bytes)?;
        self.derived =
            res.buffers_mut()
                .allocate(self.common.slot, "derived", prim_bytes * DERIVED_FACTOR)?;
        if let Some(seed) = self.seed.take() {
            let len = seed.len().min(self.prims.size as usize);
            res.buffers_mut().write_payload(self.prims, 0, &seed[..len])?;
        }
        Ok(())
    }

    pub fn render(&mut self, _time: f64, res: &mut CardResourceManager) -> Result<()> {
        let mut record = self.common.meta_record(kind::HDRAW);
        record.buffer_offset = self.prims.offset;
        record.buffer_len = self.prims.size;
        // The derived range rides in the texture fields; the hdraw shader
        // knows the layout.
        record.atlas_x = self.derived.offset;
        record.atlas_y = self.derived.size;
        self.common.write_meta(res, &record)
    }

    pub fn update(&mut self, args: &str, payload: &[u8]) -> Result<()> {
        if let Some(prims) = parse_prims(args) {
            self.prim_capacity = prims;
            self.prims = BufferHandle::INVALID;
            self.derived = BufferHandle::INVALID;
        }
        if !payload.is_empty() {
            self.seed = Some(payload.to_vec());
        }
        Ok(())
    }

    pub fn help() -> &'static str {
        "hdraw: hierarchical GPU drawing with a derived pass\n\
         \n\
         card args:\n\
         \x20 --prims <count>   primitive capacity (default 256, 16 B each)\n\
         \n\
         payload: optional initial primitives; stream via the 'prims' scope,\n\
         the 'derived' scope is produced on the GPU"
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceConfig;

    #[test]
    fn two_scopes_are_allocated() {
        let mut res = CardResourceManager::private(1 << 18, ResourceConfig::default());
        let slot = res.allocate_slot().unwrap();
        let mut card = HDrawCard::create(&mut res, slot, 0, 0, 20, 10, "--prims 32", &[]).unwrap();

        res.buffers_mut().begin_frame();
        card.declare_buffer_needs(&mut res);
        res.commit_reservations().unwrap();
        card.allocate_buffers(&mut res).unwrap();

        assert_eq!(res.buffers().lookup(slot, "prims").unwrap().1, 32 * 16);
        assert_eq!(res.buffers().lookup(slot, "derived").unwrap().1, 32 * 16 * 4);
    }
}
