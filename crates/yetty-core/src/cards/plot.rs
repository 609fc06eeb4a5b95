//! Plot card: renders float series streamed into named buffers.
//!
//! The card itself computes nothing; it declares one storage buffer per
//! `--buffer <scope>=<floats>` argument and publishes the primary buffer's
//! location in its metadata record. Remote writers stream samples straight
//! into shared memory; the shader reads them off the storage buffer.

use rustc_hash::FxHashMap;
use tracing::debug;

use super::{kind, parse_buffer_decls, CardCommon};
use crate::error::Result;
use crate::resources::{BufferHandle, CardResourceManager};

#[derive(Debug)]
pub struct PlotCard {
    pub common: CardCommon,
    /// Declared scopes in declaration order: (scope, float count).
    decls: Vec<(String, u32)>,
    handles: FxHashMap<String, BufferHandle>,
    /// Initial samples from the run payload, written once after allocation.
    seed: Option<Vec<u8>>,
}

impl PlotCard {
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
        let decls = parse_buffer_decls(args);
        debug!(slot, buffers = decls.len(), "plot card created");
        Ok(Self {
            common,
            decls,
            handles: FxHashMap::default(),
            seed: (!payload.is_empty()).then(|| payload.to_vec()),
        })
    }

    pub fn declare_buffer_needs(&mut self, res: &mut CardResourceManager) {
        for (_, floats) in &self.decls {
            res.buffers_mut().reserve(floats * 4);
        }
    }

    pub fn allocate_buffers(&mut self, res: &mut CardResourceManager) -> Result<()> {
        self.handles.clear();
        for (scope, floats) in &self.decls {
            let handle = res
                .buffers_mut()
                .allocate(self.common.slot, scope, floats * 4)?;
            self.handles.insert(scope.clone(), handle);
        }
        if let Some(seed) = self.seed.take() {
            if let Some((scope, _)) = self.decls.first() {
                if let Some(handle) = self.handles.get(scope) {
                    let len = seed.len().min(handle.size as usize);
                    res.buffers_mut().write_payload(*handle, 0, &seed[..len])?;
                }
            }
        }
        Ok(())
    }

    pub fn render(&mut self, _time: f64, res: &mut CardResourceManager) -> Result<()> {
        let mut record = self.common.meta_record(kind::PLOT);
        if let Some(handle) = self.decls.first().and_then(|(scope, _)| self.handles.get(scope)) {
            record.buffer_offset = handle.offset;
            record.buffer_len = handle.size;
        }
        self.common.write_meta(res, &record)
    }

    pub fn update(&mut self, args: &str, payload: &[u8]) -> Result<()> {
        if !args.is_empty() {
            let decls = parse_buffer_decls(args);
            if !decls.is_empty() {
                self.decls = decls;
                self.handles.clear();
            }
        }
        if !payload.is_empty() {
            self.seed = Some(payload.to_vec());
        }
        Ok(())
    }

    /// Handle of a declared scope (valid between Loop 2 and the next Loop 1).
    pub fn buffer(&self, scope: &str) -> Option<BufferHandle> {
        self.handles.get(scope).copied()
    }

    pub fn help() -> &'static str {
        "plot: stream float series into named buffers\n\
         \n\
         card args:\n\
         \x20 --buffer <scope>=<floats>   declare a stream buffer (repeatable)\n\
         \n\
         payload: optional initial f32 samples for the first buffer\n\
         \n\
         stream with: stream_get_buffer{name,scope} then seqlock-bracketed writes"
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceConfig;

    fn res() -> CardResourceManager {
        CardResourceManager::private(1 << 16, ResourceConfig::default())
    }

    fn run_frame(card: &mut PlotCard, res: &mut CardResourceManager) {
        res.buffers_mut().begin_frame();
        card.declare_buffer_needs(res);
        res.commit_reservations().unwrap();
        card.allocate_buffers(res).unwrap();
        card.render(0.0, res).unwrap();
    }

    #[test]
    fn declares_and_allocates_named_buffers() {
        let mut res = res();
        let slot = res.allocate_slot().unwrap();
        let mut card = PlotCard::create(
            &mut res,
            slot,
            0,
            0,
            80,
            20,
            "--buffer waveform=400",
            &[],
        )
        .unwrap();
        run_frame(&mut card, &mut res);

        let handle = card.buffer("waveform").unwrap();
        assert_eq!(handle.size, 1600);
        assert_eq!(res.buffers().lookup(slot, "waveform"), Some((handle.offset - 16, 1600)));
    }

    #[test]
    fn seed_payload_lands_in_first_buffer() {
        let mut res = res();
        let slot = res.allocate_slot().unwrap();
        let samples: Vec<u8> = 1.0f32
            .to_le_bytes()
            .iter()
            .chain(2.0f32.to_le_bytes().iter())
            .copied()
            .collect();
        let mut card =
            PlotCard::create(&mut res, slot, 0, 0, 10, 4, "--buffer data=4", &samples).unwrap();
        run_frame(&mut card, &mut res);

        let handle = card.buffer("data").unwrap();
        let bytes = res.buffers_mut().read_payload(handle);
        assert_eq!(&bytes[..8], &samples[..]);
    }

    #[test]
    fn metadata_points_at_primary_buffer() {
        let mut res = res();
        let slot = res.allocate_slot().unwrap();
        let mut card =
            PlotCard::create(&mut res, slot, 2, 3, 40, 10, "--buffer w=100", &[]).unwrap();
        run_frame(&mut card, &mut res);

        let handle = card.buffer("w").unwrap();
        let meta = card.common.meta;
        let data = &res.metadata().data()
            [meta.offset as usize..(meta.offset + meta.size) as usize];
        let record: super::super::CardMetaRecord = bytemuck::pod_read_unaligned(&data[..64]);
        assert_eq!(record.kind, kind::PLOT);
        assert_eq!(record.buffer_offset, handle.offset);
        assert_eq!(record.buffer_len, 400);
        assert_eq!((record.x, record.y), (2, 3));
    }
}
