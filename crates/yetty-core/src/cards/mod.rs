//! Card model: the typed inline widgets hosted by a screen.
//!
//! A card is a sum type over the built-in variants. Each variant declares
//! its resource capabilities statically (`needs_buffer` / `needs_texture`)
//! and participates in the per-frame 3-loop protocol through the methods
//! here; dispatch is on the enum discriminant. Cards own handles into the
//! resource manager's arenas, never the resources themselves, so disposing
//! a card is returning its handles.

pub mod factory;

mod hdraw;
mod plot;
mod texture;
mod ydraw;

pub use factory::CardFactory;
pub use hdraw::HDrawCard;
pub use plot::PlotCard;
pub use texture::TextureCard;
pub use ydraw::YDrawCard;

use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::resources::{CardResourceManager, MetadataHandle};

/// Shader-visible per-card record, written into the card's metadata slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CardMetaRecord {
    pub kind: u32,
    pub slot: u32,
    pub x: i32,
    pub y: i32,
    pub width_cells: u32,
    pub height_cells: u32,
    /// Payload offset of the card's primary buffer in the storage arena.
    pub buffer_offset: u32,
    pub buffer_len: u32,
    pub atlas_x: u32,
    pub atlas_y: u32,
    pub tex_width: u32,
    pub tex_height: u32,
    pub running: u32,
    _pad: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<CardMetaRecord>() == 64);

/// Metadata kind discriminants shared with the card shaders.
pub mod kind {
    pub const TEXTURE: u32 = 1;
    pub const PLOT: u32 = 2;
    pub const YDRAW: u32 = 3;
    pub const HDRAW: u32 = 4;
}

/// State shared by every card variant.
#[derive(Debug)]
pub struct CardCommon {
    pub slot: u32,
    pub x: i32,
    pub y: i32,
    pub width_cells: u32,
    pub height_cells: u32,
    pub meta: MetadataHandle,
}

impl CardCommon {
    pub fn new(
        res: &mut CardResourceManager,
        slot: u32,
        x: i32,
        y: i32,
        width_cells: u32,
        height_cells: u32,
    ) -> Result<Self> {
        let meta = res.allocate_metadata(std::mem::size_of::<CardMetaRecord>() as u32)?;
        Ok(Self {
            slot,
            x,
            y,
            width_cells,
            height_cells,
            meta,
        })
    }

    /// Base record with geometry filled in; variants complete it.
    pub fn meta_record(&self, kind: u32) -> CardMetaRecord {
        CardMetaRecord {
            kind,
            slot: self.slot,
            x: self.x,
            y: self.y,
            width_cells: self.width_cells,
            height_cells: self.height_cells,
            running: 1,
            ..CardMetaRecord::default()
        }
    }

    pub fn write_meta(&self, res: &mut CardResourceManager, record: &CardMetaRecord) -> Result<()> {
        res.write_metadata(self.meta, bytemuck::bytes_of(record))
    }
}

/// A card instance. Variants are the built-in set registered by the factory.
#[derive(Debug)]
pub enum Card {
    Texture(TextureCard),
    Plot(PlotCard),
    YDraw(YDrawCard),
    HDraw(HDrawCard),
}

impl Card {
    pub fn type_name(&self) -> &'static str {
        match self {
            Card::Texture(_) => "texture",
            Card::Plot(_) => "plot",
            Card::YDraw(_) => "ydraw",
            Card::HDraw(_) => "hdraw",
        }
    }

    pub fn needs_buffer(&self) -> bool {
        match self {
            Card::Texture(_) => false,
            Card::Plot(_) | Card::YDraw(_) | Card::HDraw(_) => true,
        }
    }

    pub fn needs_texture(&self) -> bool {
        matches!(self, Card::Texture(_))
    }

    pub fn common(&self) -> &CardCommon {
        match self {
            Card::Texture(c) => &c.common,
            Card::Plot(c) => &c.common,
            Card::YDraw(c) => &c.common,
            Card::HDraw(c) => &c.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CardCommon {
        match self {
            Card::Texture(c) => &mut c.common,
            Card::Plot(c) => &mut c.common,
            Card::YDraw(c) => &mut c.common,
            Card::HDraw(c) => &mut c.common,
        }
    }

    pub fn slot(&self) -> u32 {
        self.common().slot
    }

    // =========================================================================
    // 3-loop lifecycle, driven by the screen for visible cards
    // =========================================================================

    /// Loop 1: buffer cards declare their byte totals.
    pub fn declare_buffer_needs(&mut self, res: &mut CardResourceManager) {
        match self {
            Card::Texture(_) => {}
            Card::Plot(c) => c.declare_buffer_needs(res),
            Card::YDraw(c) => c.declare_buffer_needs(res),
            Card::HDraw(c) => c.declare_buffer_needs(res),
        }
    }

    /// Loop 2: allocate (re-register) buffers.
    pub fn allocate_buffers(&mut self, res: &mut CardResourceManager) -> Result<()> {
        match self {
            Card::Texture(_) => Ok(()),
            Card::Plot(c) => c.allocate_buffers(res),
            Card::YDraw(c) => c.allocate_buffers(res),
            Card::HDraw(c) => c.allocate_buffers(res),
        }
    }

    /// Loop 2: declare atlas reservations.
    pub fn allocate_textures(&mut self, res: &mut CardResourceManager) -> Result<()> {
        match self {
            Card::Texture(c) => c.allocate_textures(res),
            _ => Ok(()),
        }
    }

    /// Per-frame render: refresh metadata (and, for texture cards, pixels —
    /// their atlas position is only known after Loop 3).
    pub fn render(&mut self, time: f64, res: &mut CardResourceManager) -> Result<()> {
        match self {
            Card::Texture(c) => c.render(time, res),
            Card::Plot(c) => c.render(time, res),
            Card::YDraw(c) => c.render(time, res),
            Card::HDraw(c) => c.render(time, res),
        }
    }

    /// Retarget a live card (OSC `update`): new card args and/or payload.
    pub fn update(&mut self, args: &str, payload: &[u8]) -> Result<()> {
        match self {
            Card::Texture(c) => c.update(args, payload),
            Card::Plot(c) => c.update(args, payload),
            Card::YDraw(c) => c.update(args, payload),
            Card::HDraw(c) => c.update(args, payload),
        }
    }

    /// Return every handle to its manager. The card is unusable afterwards.
    pub fn dispose(&mut self, res: &mut CardResourceManager) -> Result<()> {
        if let Card::Texture(c) = self {
            c.release_texture(res)?;
        }
        let meta = self.common().meta;
        res.deallocate_metadata(meta)?;
        self.common_mut().meta = MetadataHandle::INVALID;
        Ok(())
    }
}

/// Split a card-args string into `--flag value` style tokens, double-quote
/// aware (same lexer the generic args use).
pub(crate) fn tokenize_args(args: &str) -> Vec<String> {
    crate::osc::command::tokenize(args)
}

/// Largest float count a single `--buffer` declaration may request (256 MiB
/// of f32). Larger declarations are clamped.
pub(crate) const MAX_BUFFER_FLOATS: u32 = 64 * 1024 * 1024;

/// Parse `--buffer <scope>=<floats>` declarations from card args.
pub(crate) fn parse_buffer_decls(args: &str) -> Vec<(String, u32)> {
    let tokens = tokenize_args(args);
    let mut decls = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "--buffer" || tokens[i] == "-b" {
            if let Some(spec) = tokens.get(i + 1) {
                if let Some((scope, count)) = spec.split_once('=') {
                    if let Ok(count) = count.parse::<u32>() {
                        if !scope.is_empty() && count > 0 {
                            decls.push((scope.to_string(), count.min(MAX_BUFFER_FLOATS)));
                        }
                    }
                }
                i += 1;
            }
        }
        i += 1;
    }
    decls
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_record_is_one_metadata_class() {
        assert_eq!(std::mem::size_of::<CardMetaRecord>(), 64);
    }

    #[test]
    fn buffer_decls_parse() {
        assert_eq!(
            parse_buffer_decls("--buffer waveform=400"),
            vec![("waveform".to_string(), 400)]
        );
        assert_eq!(
            parse_buffer_decls("--buffer a=1 --other x --buffer b=2"),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
        assert!(parse_buffer_decls("").is_empty());
        assert!(parse_buffer_decls("--buffer broken").is_empty());
        assert!(parse_buffer_decls("--buffer =4").is_empty());
        assert!(parse_buffer_decls("--buffer x=0").is_empty());
    }
}
