//! Facade over the card storage classes plus slot and name bookkeeping.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resources::atlas::{AtlasConfig, AtlasManager};
use crate::resources::buffer::BufferManager;
use crate::resources::metadata::{MetadataConfig, MetadataHandle, MetadataManager};
use crate::resources::MAX_CARD_SLOTS;
use crate::shm::SharedMemoryRegion;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceConfig {
    pub metadata: MetadataConfig,
    pub atlas: AtlasConfig,
}

/// Owns the metadata buffer, linear storage buffer and atlas, and presents
/// them as one unit to the per-frame protocol and to the streaming RPC.
pub struct CardResourceManager {
    metadata: MetadataManager,
    buffers: BufferManager,
    atlas: AtlasManager,

    // Slot arena: stable numeric card identities.
    slot_live: Vec<bool>,
    slot_free: Vec<u32>,

    // Named-card registry, bijective with the live named set.
    name_to_slot: FxHashMap<String, u32>,
    slot_to_name: FxHashMap<u32, String>,

    bind_group_dirty: bool,
    /// Set by `stream_mark_dirty`; the host may use it to expedite a frame.
    render_requested: bool,
}

impl CardResourceManager {
    /// Streaming-enabled: card buffers live in the shared region.
    pub fn with_shm(region: SharedMemoryRegion, config: ResourceConfig) -> Result<Self> {
        Ok(Self::new(BufferManager::with_shm(region)?, config))
    }

    /// Streaming-disabled: card buffers live in a private arena.
    pub fn private(buffer_size: usize, config: ResourceConfig) -> Self {
        Self::new(BufferManager::private(buffer_size), config)
    }

    fn new(buffers: BufferManager, config: ResourceConfig) -> Self {
        Self {
            metadata: MetadataManager::new(config.metadata),
            buffers,
            atlas: AtlasManager::new(config.atlas),
            slot_live: Vec::new(),
            slot_free: Vec::new(),
            name_to_slot: FxHashMap::default(),
            slot_to_name: FxHashMap::default(),
            bind_group_dirty: true,
            render_requested: false,
        }
    }

    // =========================================================================
    // Slot arena
    // =========================================================================

    /// Claim a stable slot index for a new card.
    pub fn allocate_slot(&mut self) -> Result<u32> {
        if let Some(slot) = self.slot_free.pop() {
            self.slot_live[slot as usize] = true;
            return Ok(slot);
        }
        let slot = self.slot_live.len() as u32;
        if slot >= MAX_CARD_SLOTS {
            return Err(Error::OutOfSpace(format!(
                "all {MAX_CARD_SLOTS} card slots in use"
            )));
        }
        self.slot_live.push(true);
        Ok(slot)
    }

    /// Release a card's slot and everything keyed on it: buffer allocations
    /// and the name binding go synchronously with the card.
    pub fn release_slot(&mut self, slot: u32) {
        let Some(live) = self.slot_live.get_mut(slot as usize) else {
            return;
        };
        if !*live {
            return;
        }
        *live = false;
        self.slot_free.push(slot);
        self.buffers.release_slot(slot);
        if let Some(name) = self.slot_to_name.remove(&slot) {
            self.name_to_slot.remove(&name);
        }
        debug!(slot, "card slot released");
    }

    pub fn is_slot_live(&self, slot: u32) -> bool {
        self.slot_live.get(slot as usize).copied().unwrap_or(false)
    }

    // =========================================================================
    // Named-card registry
    // =========================================================================

    /// Bind `name` to `slot`. A collision overwrites the prior binding with
    /// a warning.
    pub fn register_named_card(&mut self, name: &str, slot: u32) {
        if let Some(old_slot) = self.name_to_slot.insert(name.to_string(), slot) {
            warn!(name, old_slot, new_slot = slot, "card name re-bound");
            self.slot_to_name.remove(&old_slot);
        }
        if let Some(old_name) = self.slot_to_name.insert(slot, name.to_string()) {
            if old_name != name {
                self.name_to_slot.remove(&old_name);
            }
        }
    }

    pub fn unregister_named_card(&mut self, name: &str) {
        if let Some(slot) = self.name_to_slot.remove(name) {
            self.slot_to_name.remove(&slot);
        }
    }

    pub fn slot_by_name(&self, name: &str) -> Option<u32> {
        self.name_to_slot.get(name).copied()
    }

    /// Name bound to `slot`, or the empty string.
    pub fn name_by_slot(&self, slot: u32) -> &str {
        self.slot_to_name.get(&slot).map(String::as_str).unwrap_or("")
    }

    // =========================================================================
    // Metadata operations
    // =========================================================================

    pub fn allocate_metadata(&mut self, size: u32) -> Result<MetadataHandle> {
        self.metadata.allocate(size)
    }

    pub fn deallocate_metadata(&mut self, handle: MetadataHandle) -> Result<()> {
        self.metadata.deallocate(handle)
    }

    pub fn write_metadata(&mut self, handle: MetadataHandle, bytes: &[u8]) -> Result<()> {
        self.metadata.write(handle, bytes)
    }

    pub fn write_metadata_at(
        &mut self,
        handle: MetadataHandle,
        offset: u32,
        bytes: &[u8],
    ) -> Result<()> {
        self.metadata.write_at(handle, offset, bytes)
    }

    // =========================================================================
    // Storage-class accessors (cards and the frame driver reach in directly)
    // =========================================================================

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BufferManager {
        &mut self.buffers
    }

    pub fn atlas(&self) -> &AtlasManager {
        &self.atlas
    }

    pub fn atlas_mut(&mut self) -> &mut AtlasManager {
        &mut self.atlas
    }

    pub fn metadata(&self) -> &MetadataManager {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataManager {
        &mut self.metadata
    }

    // =========================================================================
    // Frame orchestration (CPU side; GPU uploads live behind the `gpu`
    // feature in `crate::gpu`)
    // =========================================================================

    /// Between Loop 1 and Loop 2: grow the arena once if reservations demand
    /// it and flag the bind group when the buffer was recreated.
    pub fn commit_reservations(&mut self) -> Result<()> {
        self.buffers.commit_reservations()?;
        if self.buffers.take_recreated() {
            self.bind_group_dirty = true;
        }
        Ok(())
    }

    /// Loop 3, on texture set change: repack and flag the bind group if this
    /// was the pack that initialized (or resized) the atlas.
    pub fn pack_atlas(&mut self) -> Result<()> {
        let size_before = (self.atlas.is_initialized(), self.atlas.atlas_size());
        self.atlas.pack()?;
        if size_before != (true, self.atlas.atlas_size()) {
            self.bind_group_dirty = true;
        }
        Ok(())
    }

    /// Whether `update_bind_group` (gpu feature) must rebuild before the
    /// next draw.
    pub fn bind_group_dirty(&self) -> bool {
        self.bind_group_dirty
    }

    pub fn mark_bind_group_dirty(&mut self) {
        self.bind_group_dirty = true;
    }

    pub fn clear_bind_group_dirty(&mut self) {
        self.bind_group_dirty = false;
    }

    /// `stream_mark_dirty` advisory: ask the host for an expedited frame.
    pub fn request_render(&mut self) {
        self.render_requested = true;
    }

    /// Poll-and-clear the expedite flag (read by the host's frame pacing).
    pub fn take_render_requested(&mut self) -> bool {
        std::mem::take(&mut self.render_requested)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CardResourceManager {
        CardResourceManager::private(1 << 16, ResourceConfig::default())
    }

    #[test]
    fn slots_are_stable_and_reused() {
        let mut mgr = manager();
        let a = mgr.allocate_slot().unwrap();
        let b = mgr.allocate_slot().unwrap();
        assert_ne!(a, b);
        mgr.release_slot(a);
        assert!(!mgr.is_slot_live(a));
        let c = mgr.allocate_slot().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn registry_is_bijective() {
        let mut mgr = manager();
        let slot = mgr.allocate_slot().unwrap();
        mgr.register_named_card("audio", slot);
        assert_eq!(mgr.slot_by_name("audio"), Some(slot));
        assert_eq!(mgr.name_by_slot(slot), "audio");

        mgr.unregister_named_card("audio");
        assert_eq!(mgr.slot_by_name("audio"), None);
        assert_eq!(mgr.name_by_slot(slot), "");
    }

    #[test]
    fn name_collision_overwrites() {
        let mut mgr = manager();
        let a = mgr.allocate_slot().unwrap();
        let b = mgr.allocate_slot().unwrap();
        mgr.register_named_card("chart", a);
        mgr.register_named_card("chart", b);
        assert_eq!(mgr.slot_by_name("chart"), Some(b));
        assert_eq!(mgr.name_by_slot(a), "");
        assert_eq!(mgr.name_by_slot(b), "chart");
    }

    #[test]
    fn release_slot_drops_name_and_buffers() {
        let mut mgr = manager();
        let slot = mgr.allocate_slot().unwrap();
        mgr.register_named_card("audio", slot);

        mgr.buffers_mut().begin_frame();
        mgr.buffers_mut().reserve(400);
        mgr.commit_reservations().unwrap();
        mgr.buffers_mut().allocate(slot, "waveform", 400).unwrap();
        assert!(mgr.buffers().lookup(slot, "waveform").is_some());

        mgr.release_slot(slot);
        assert_eq!(mgr.slot_by_name("audio"), None);
        assert_eq!(mgr.buffers().lookup(slot, "waveform"), None);
    }

    #[test]
    fn buffer_growth_dirties_bind_group() {
        let mut mgr = CardResourceManager::private(1 << 10, ResourceConfig::default());
        mgr.clear_bind_group_dirty();
        mgr.buffers_mut().begin_frame();
        mgr.buffers_mut().reserve(1 << 20);
        mgr.commit_reservations().unwrap();
        assert!(mgr.bind_group_dirty());
    }

    #[test]
    fn atlas_pack_dirties_bind_group_once_initialized() {
        let mut mgr = manager();
        mgr.clear_bind_group_dirty();
        mgr.atlas_mut().allocate(16, 16).unwrap();
        mgr.pack_atlas().unwrap();
        assert!(mgr.bind_group_dirty());

        // A pack at the same size with the atlas already live keeps the
        // bind group as-is.
        mgr.clear_bind_group_dirty();
        mgr.atlas_mut().allocate(16, 16).unwrap();
        mgr.pack_atlas().unwrap();
        assert!(!mgr.bind_group_dirty());
    }

    #[test]
    fn render_request_is_poll_and_clear() {
        let mut mgr = manager();
        assert!(!mgr.take_render_requested());
        mgr.request_render();
        assert!(mgr.take_render_requested());
        assert!(!mgr.take_render_requested());
    }
}
