//! GPU resource arbitration for cards.
//!
//! Three storage classes live here, all surfaced to shaders through a single
//! bind group: the metadata buffer ([`metadata`]), the linear storage buffer
//! ([`buffer`]) and the texture atlas ([`atlas`]). The
//! [`CardResourceManager`] facade owns all three, the card slot arena, and
//! the name registry consulted by the streaming RPC.

pub mod atlas;
pub mod buffer;
pub mod manager;
pub mod metadata;

pub use atlas::{AtlasConfig, AtlasManager, AtlasPosition, DirtyRect, TextureHandle};
pub use buffer::{BufferHandle, BufferInfo, BufferManager, BufferStats};
pub use manager::{CardResourceManager, ResourceConfig};
pub use metadata::{MetadataConfig, MetadataHandle, MetadataManager};

/// Maximum unique card slots tracked per terminal.
pub const MAX_CARD_SLOTS: u32 = 16384;
