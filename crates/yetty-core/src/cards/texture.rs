//! Texture card: shows RGBA8 pixels from an atlas reservation.
//!
//! Pixel decoding (PNG, PDF pages, vector rasterization) happens in the
//! providers outside this crate; the card receives raw RGBA8 in its payload
//! and moves it through the atlas protocol: allocate in Loop 2, learn the
//! position after the Loop 3 pack, then write pixels and metadata.

use tracing::debug;

use super::{kind, tokenize_args, CardCommon};
use crate::error::{Error, Result};
use crate::resources::{CardResourceManager, TextureHandle};

#[derive(Debug)]
pub struct TextureCard {
    pub common: CardCommon,
    width_px: u32,
    height_px: u32,
    handle: TextureHandle,
    pixels: Option<Vec<u8>>,
    pixels_written: bool,
}

impl TextureCard {
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
        let (width_px, height_px) = parse_size(args)
            .ok_or_else(|| Error::InvalidArgument("texture: --size <W>x<H> is required".into()))?;

        let expected = u64::from(width_px) * u64::from(height_px) * 4;
        let pixels = if payload.is_empty() {
            None
        } else if payload.len() as u64 == expected {
            Some(payload.to_vec())
        } else {
            return Err(Error::InvalidArgument(format!(
                "texture: payload is {} B, {width_px}x{height_px} RGBA8 needs {expected}",
                payload.len(),
            )));
        };

        debug!(slot, width_px, height_px, "texture card created");
        Ok(Self {
            common,
            width_px,
            height_px,
            handle: TextureHandle::INVALID,
            pixels,
            pixels_written: false,
        })
    }

    pub fn allocate_textures(&mut self, res: &mut CardResourceManager) -> Result<()> {
        if self.handle.is_valid() {
            return Ok(());
        }
        let mut w = self.width_px;
        let mut h = self.height_px;
        loop {
            match res.atlas_mut().allocate(w, h) {
                Ok(handle) => {
                    if (w, h) != (self.width_px, self.height_px) {
                        // Downscaled to fit the atlas maximum; the provider
                        // re-samples, this card only tracks the real dims.
                        debug!(
                            slot = self.common.slot,
                            w, h, "texture downscaled to atlas maximum"
                        );
                        self.width_px = w;
                        self.height_px = h;
                        self.pixels = None;
                    }
                    self.handle = handle;
                    return Ok(());
                }
                Err(Error::TooLarge(_)) if w > 1 || h > 1 => {
                    w = (w / 2).max(1);
                    h = (h / 2).max(1);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn render(&mut self, _time: f64, res: &mut CardResourceManager) -> Result<()> {
        // Atlas position exists only after Loop 3 packed this handle.
        let Some(position) = res.atlas().position(self.handle) else {
            return Ok(());
        };
        if !self.pixels_written {
            if let Some(pixels) = &self.pixels {
                res.atlas_mut().write(self.handle, pixels)?;
            }
            self.pixels_written = true;
        }
        let mut record = self.common.meta_record(kind::TEXTURE);
        record.atlas_x = position.x;
        record.atlas_y = position.y;
        record.tex_width = self.width_px;
        record.tex_height = self.height_px;
        self.common.write_meta(res, &record)
    }

    pub fn update(&mut self, _args: &str, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let expected = u64::from(self.width_px) * u64::from(self.height_px) * 4;
        if payload.len() as u64 != expected {
            return Err(Error::InvalidArgument(format!(
                "texture: payload is {} B, expected {expected}",
                payload.len(),
            )));
        }
        self.pixels = Some(payload.to_vec());
        self.pixels_written = false;
        Ok(())
    }

    pub fn release_texture(&mut self, res: &mut CardResourceManager) -> Result<()> {
        if self.handle.is_valid() {
            res.atlas_mut().deallocate(self.handle)?;
            self.handle = TextureHandle::INVALID;
        }
        Ok(())
    }

    pub fn texture_handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width_px, self.height_px)
    }

    pub fn help() -> &'static str {
        "texture: display RGBA8 pixels from the card atlas\n\
         \n\
         card args:\n\
         \x20 --size <W>x<H>   pixel dimensions (required)\n\
         \n\
         payload: W*H*4 bytes of RGBA8, or empty to fill later via update"
    }
}

fn parse_size(args: &str) -> Option<(u32, u32)> {
    let tokens = tokenize_args(args);
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "--size" || tokens[i] == "-s" {
            let spec = tokens.get(i + 1)?;
            let (w, h) = spec.split_once('x')?;
            let (w, h) = (w.parse().ok()?, h.parse().ok()?);
            if w == 0 || h == 0 {
                return None;
            }
            return Some((w, h));
        }
        i += 1;
    }
    None
}
