//! Texture atlas for cards (bind group bindings 3/4).
//!
//! Texture cards declare sizes with [`allocate`](AtlasManager::allocate) and
//! learn their placement only after the next [`pack`](AtlasManager::pack)
//! (Loop 3, run when a texture card enters or leaves, or changes size). The
//! atlas starts at 2048x2048 RGBA8 and doubles up to the configured maximum
//! when the packer cannot fit the working set. Pixels are cached per handle
//! so a re-pack re-blits every surviving texture into its new position.

use guillotiere::{size2, AtlasAllocator};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::error::{Error, Result};

const BYTES_PER_PIXEL: u32 = 4; // RGBA8

/// Opaque atlas reservation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

impl TextureHandle {
    pub const INVALID: TextureHandle = TextureHandle(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Pixel position within the atlas, valid after the next pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasPosition {
    pub x: u32,
    pub y: u32,
}

/// Dirty region of the atlas image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AtlasConfig {
    pub initial_size: u32,
    pub max_size: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            initial_size: 2048,
            max_size: 8192,
        }
    }
}

struct Entry {
    width: u32,
    height: u32,
    position: Option<AtlasPosition>,
    pixels: Option<Vec<u8>>,
}

/// Shelf-style atlas manager over a rectangle packer.
pub struct AtlasManager {
    config: AtlasConfig,
    entries: FxHashMap<TextureHandle, Entry>,
    next_id: u32,
    size: u32,
    image: Vec<u8>,
    initialized: bool,
    set_changed: bool,
    dirty: SmallVec<[DirtyRect; 8]>,
}

impl AtlasManager {
    pub fn new(config: AtlasConfig) -> Self {
        Self {
            config,
            entries: FxHashMap::default(),
            next_id: 1,
            size: config.initial_size,
            image: Vec::new(),
            initialized: false,
            set_changed: false,
            dirty: SmallVec::new(),
        }
    }

    /// Declare a texture of `width` x `height` RGBA8 pixels.
    pub fn allocate(&mut self, width: u32, height: u32) -> Result<TextureHandle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero-area texture {width}x{height}"
            )));
        }
        if width > self.config.max_size || height > self.config.max_size {
            // The card is expected to downscale.
            return Err(Error::TooLarge(format!(
                "texture {width}x{height} exceeds atlas maximum {}",
                self.config.max_size
            )));
        }
        let handle = TextureHandle(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            handle,
            Entry {
                width,
                height,
                position: None,
                pixels: None,
            },
        );
        self.set_changed = true;
        debug!(id = handle.0, width, height, "texture allocated");
        Ok(handle)
    }

    pub fn deallocate(&mut self, handle: TextureHandle) -> Result<()> {
        if self.entries.remove(&handle).is_none() {
            return Err(Error::NotFound(format!("texture handle {}", handle.0)));
        }
        self.set_changed = true;
        Ok(())
    }

    /// True when a texture entered/left since the last pack (the screen runs
    /// Loop 3 exactly then).
    pub fn needs_pack(&self) -> bool {
        self.set_changed && !self.entries.is_empty()
    }

    /// Loop 3: lay every declared texture out, doubling the atlas until the
    /// set fits or the maximum dimension is reached.
    pub fn pack(&mut self) -> Result<()> {
        // Largest first packs tighter and deterministically.
        let mut order: Vec<TextureHandle> = self.entries.keys().copied().collect();
        order.sort_by_key(|h| {
            let e = &self.entries[h];
            (std::cmp::Reverse(e.height), std::cmp::Reverse(e.width), h.0)
        });

        let mut size = self.size;
        let placements = loop {
            match try_pack(size, &order, &self.entries) {
                Some(placements) => break placements,
                None => {
                    if size >= self.config.max_size {
                        return Err(Error::OutOfSpace(format!(
                            "atlas exhausted at {size}x{size} for {} textures",
                            self.entries.len()
                        )));
                    }
                    size = (size * 2).min(self.config.max_size);
                }
            }
        };

        if size != self.size || self.image.is_empty() {
            self.image = vec![0; (size * size * BYTES_PER_PIXEL) as usize];
        } else {
            self.image.fill(0);
        }
        self.size = size;

        for (handle, position) in placements {
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.position = Some(position);
            }
        }
        // Re-blit cached pixels into the new layout.
        let handles: Vec<TextureHandle> = self.entries.keys().copied().collect();
        for handle in handles {
            if let Some(pixels) = self.entries.get(&handle).and_then(|e| e.pixels.clone()) {
                self.blit(handle, &pixels)?;
            }
        }

        self.initialized = true;
        self.set_changed = false;
        self.dirty.clear();
        self.dirty.push(DirtyRect {
            x: 0,
            y: 0,
            width: self.size,
            height: self.size,
        });
        info!(size = self.size, textures = self.entries.len(), "packed card atlas");
        Ok(())
    }

    /// Position assigned by the last pack, if any.
    pub fn position(&self, handle: TextureHandle) -> Option<AtlasPosition> {
        self.entries.get(&handle).and_then(|e| e.position)
    }

    /// Write a texture's pixels (RGBA8, `width * height * 4` bytes). Valid
    /// only after the handle was placed by a pack.
    pub fn write(&mut self, handle: TextureHandle, pixels: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("texture handle {}", handle.0)))?;
        let expected = (entry.width * entry.height * BYTES_PER_PIXEL) as usize;
        if pixels.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "expected {expected} pixel bytes, got {}",
                pixels.len()
            )));
        }
        if entry.position.is_none() {
            return Err(Error::Unavailable(format!(
                "texture handle {} not packed yet",
                handle.0
            )));
        }
        entry.pixels = Some(pixels.to_vec());
        self.blit(handle, pixels)
    }

    fn blit(&mut self, handle: TextureHandle, pixels: &[u8]) -> Result<()> {
        let entry = &self.entries[&handle];
        let Some(pos) = entry.position else {
            return Ok(()); // repack will place it
        };
        let row_bytes = (entry.width * BYTES_PER_PIXEL) as usize;
        let stride = (self.size * BYTES_PER_PIXEL) as usize;
        for row in 0..entry.height as usize {
            let src = row * row_bytes;
            let dst = (pos.y as usize + row) * stride + pos.x as usize * BYTES_PER_PIXEL as usize;
            self.image[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }
        self.dirty.push(DirtyRect {
            x: pos.x,
            y: pos.y,
            width: entry.width,
            height: entry.height,
        });
        Ok(())
    }

    pub fn atlas_size(&self) -> u32 {
        self.size
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Raw RGBA8 atlas image (empty before the first pack).
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Drain dirty regions for this frame's upload.
    pub fn take_dirty(&mut self) -> SmallVec<[DirtyRect; 8]> {
        std::mem::take(&mut self.dirty)
    }

    /// Placement table for the shader-side texture info buffer: packed
    /// entries as `(id, position, width, height)`, id ascending.
    pub fn records(&self) -> Vec<(u32, AtlasPosition, u32, u32)> {
        let mut rows: Vec<(u32, AtlasPosition, u32, u32)> = self
            .entries
            .iter()
            .filter_map(|(handle, e)| e.position.map(|p| (handle.0, p, e.width, e.height)))
            .collect();
        rows.sort_by_key(|(id, ..)| *id);
        rows
    }

    pub fn stats(&self) -> AtlasStats {
        AtlasStats {
            texture_count: self.entries.len() as u32,
            atlas_size: self.size,
            used_pixels: self
                .entries
                .values()
                .map(|e| (e.width * e.height) as u64)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasStats {
    pub texture_count: u32,
    pub atlas_size: u32,
    pub used_pixels: u64,
}

fn try_pack(
    size: u32,
    order: &[TextureHandle],
    entries: &FxHashMap<TextureHandle, Entry>,
) -> Option<Vec<(TextureHandle, AtlasPosition)>> {
    let mut allocator = AtlasAllocator::new(size2(size as i32, size as i32));
    let mut placements = Vec::with_capacity(order.len());
    for handle in order {
        let entry = &entries[handle];
        let alloc = allocator.allocate(size2(entry.width as i32, entry.height as i32))?;
        placements.push((
            *handle,
            AtlasPosition {
                x: alloc.rectangle.min.x as u32,
                y: alloc.rectangle.min.y as u32,
            },
        ));
    }
    Some(placements)
}
