//! Card-hosting screen: the grid-side view of the card system.
//!
//! A screen owns its cards (arena of entries addressed by slot via the
//! shared resource manager) and the cell grid they are embedded in. Card
//! cells carry a glyph codepoint above [`CARD_GLYPH_BASE`] whose low bits
//! are the slot index; such codepoints never reach the font path, the card
//! shaders pick them up instead.
//!
//! The screen drives the per-frame 3-loop protocol over its cards:
//! reserve (Loop 1), allocate (Loop 2), atlas pack on texture-set change
//! (Loop 3), then render. Stopped cards still run Loops 1 and 2 so the bump
//! allocator reproduces every card's offsets and their handles stay live;
//! they only skip rendering.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::cards::Card;
use crate::error::Result;
use crate::osc::command::CardListEntry;
use crate::resources::CardResourceManager;

/// Glyph codepoints at or above this value denote cards; the low bits carry
/// the slot index.
pub const CARD_GLYPH_BASE: u32 = 0x10_0000;

/// Encode a card slot as a grid glyph.
pub fn card_glyph(slot: u32) -> u32 {
    CARD_GLYPH_BASE | slot
}

/// Decode a grid glyph back to a card slot, if it is a card glyph.
pub fn card_slot_from_glyph(glyph: u32) -> Option<u32> {
    (glyph >= CARD_GLYPH_BASE).then_some(glyph & !CARD_GLYPH_BASE)
}

bitflags! {
    /// Style byte of a grid cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CellStyle: u8 {
        const BOLD      = 1 << 0;
        const ITALIC    = 1 << 1;
        const UNDERLINE = 1 << 2;
        const INVERSE   = 1 << 3;
    }
}

/// Wire-format grid cell (12 bytes), shared with the renderer and the grid
/// cards. `glyph` holds a UTF codepoint or a card glyph.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GridCell {
    pub glyph: u32,
    pub fg_r: u8,
    pub fg_g: u8,
    pub fg_b: u8,
    pub alpha: u8,
    pub bg_r: u8,
    pub bg_g: u8,
    pub bg_b: u8,
    pub style: u8,
}

const _: () = assert!(std::mem::size_of::<GridCell>() == 12);

impl GridCell {
    pub fn style_flags(&self) -> CellStyle {
        CellStyle::from_bits_truncate(self.style)
    }

    pub fn set_style_flags(&mut self, flags: CellStyle) {
        self.style = flags.bits();
    }

    /// Whether this cell is covered by a card.
    pub fn is_card(&self) -> bool {
        self.glyph >= CARD_GLYPH_BASE
    }
}

/// A hosted card plus its addressing state.
pub struct CardEntry {
    pub id: String,
    pub card: Card,
    pub running: bool,
}

/// One terminal screen's card host.
pub struct Screen {
    cols: u32,
    rows: u32,
    grid: Vec<GridCell>,
    cards: Vec<CardEntry>,
    cursor_x: u32,
    cursor_y: u32,
}

impl Screen {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            grid: vec![GridCell::default(); (cols * rows) as usize],
            cards: Vec::new(),
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cell(&self, x: u32, y: u32) -> Option<&GridCell> {
        (x < self.cols && y < self.rows).then(|| &self.grid[(y * self.cols + x) as usize])
    }

    pub fn set_cursor(&mut self, x: u32, y: u32) {
        self.cursor_x = x.min(self.cols.saturating_sub(1));
        self.cursor_y = y.min(self.rows.saturating_sub(1));
    }

    pub fn cursor(&self) -> (u32, u32) {
        (self.cursor_x, self.cursor_y)
    }

    /// Resolve requested geometry: `-r` offsets from the cursor, zero width
    /// or height stretches to the terminal edge.
    pub fn resolve_geometry(
        &self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        relative: bool,
    ) -> (i32, i32, u32, u32) {
        let (x, y) = if relative {
            (x + self.cursor_x as i32, y + self.cursor_y as i32)
        } else {
            (x, y)
        };
        let width = if width == 0 {
            (self.cols as i32 - x).max(1) as u32
        } else {
            width
        };
        let height = if height == 0 {
            (self.rows as i32 - y).max(1) as u32
        } else {
            height
        };
        (x, y, width, height)
    }

    /// Host a freshly created card: records the entry and stamps its cells.
    pub fn insert_card(&mut self, entry: CardEntry) {
        self.stamp(&entry.card, card_glyph(entry.card.slot()));
        debug!(id = %entry.id, slot = entry.card.slot(), "card hosted");
        self.cards.push(entry);
    }

    /// Remove a card by entry index, clearing its cells. The caller disposes
    /// the card's handles.
    pub fn remove_card_at(&mut self, index: usize) -> CardEntry {
        let entry = self.cards.remove(index);
        self.stamp(&entry.card, 0);
        entry
    }

    fn stamp(&mut self, card: &Card, glyph: u32) {
        let common = card.common();
        for dy in 0..common.height_cells as i32 {
            for dx in 0..common.width_cells as i32 {
                let (cx, cy) = (common.x + dx, common.y + dy);
                if cx < 0 || cy < 0 || cx >= self.cols as i32 || cy >= self.rows as i32 {
                    continue;
                }
                self.grid[(cy as u32 * self.cols + cx as u32) as usize].glyph = glyph;
            }
        }
    }

    pub fn cards(&self) -> &[CardEntry] {
        &self.cards
    }

    pub fn cards_mut(&mut self) -> &mut [CardEntry] {
        &mut self.cards
    }

    pub fn index_by_id(&self, id: &str) -> Option<usize> {
        self.cards.iter().position(|e| e.id == id)
    }

    pub fn index_by_slot(&self, slot: u32) -> Option<usize> {
        self.cards.iter().position(|e| e.card.slot() == slot)
    }

    /// Entry indices matching a target selector, in hosting order.
    pub fn indices_by_type(&self, type_name: &str) -> Vec<usize> {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, e)| e.card.type_name() == type_name)
            .map(|(i, _)| i)
            .collect()
    }

    /// Rows for the `ls` table (running only, or everything with `all`).
    pub fn list_entries(&self, all: bool) -> Vec<CardListEntry> {
        self.cards
            .iter()
            .filter(|e| all || e.running)
            .map(|e| {
                let c = e.card.common();
                CardListEntry {
                    id: e.id.clone(),
                    type_name: e.card.type_name().to_string(),
                    x: c.x,
                    y: c.y,
                    width: c.width_cells,
                    height: c.height_cells,
                    running: e.running,
                }
            })
            .collect()
    }

    /// Run one frame of the card protocol over this screen.
    pub fn run_frame(&mut self, time: f64, res: &mut CardResourceManager) -> Result<()> {
        // Loop 1: declare buffer needs. Stopped cards keep declaring so
        // offsets stay stable and their handles survive.
        res.buffers_mut().begin_frame();
        for entry in &mut self.cards {
            if entry.card.needs_buffer() {
                entry.card.declare_buffer_needs(res);
            }
        }
        res.commit_reservations()?;

        // Loop 2: allocate buffers and texture reservations.
        for entry in &mut self.cards {
            if entry.card.needs_buffer() {
                entry.card.allocate_buffers(res)?;
            }
            if entry.card.needs_texture() {
                entry.card.allocate_textures(res)?;
            }
        }

        // Loop 3: pack the atlas only when the texture set changed.
        if res.atlas().needs_pack() {
            res.pack_atlas()?;
        }

        // Render pass: running cards refresh their metadata and pixels.
        for entry in &mut self.cards {
            if entry.running {
                entry.card.render(time, res)?;
            }
        }
        Ok(())
    }
}
