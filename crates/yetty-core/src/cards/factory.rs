//! Type-keyed card factory.
//!
//! Card types register a creator and a help text; the OSC `run` command
//! routes through here. The built-in set mirrors what the card shaders
//! implement: `texture`, `plot`, `ydraw`, `hdraw`.

use rustc_hash::FxHashMap;
use tracing::{error, info, warn};

use super::{Card, HDrawCard, PlotCard, TextureCard, YDrawCard};
use crate::error::{Error, Result};
use crate::resources::CardResourceManager;

/// Everything a creator needs besides the resource manager.
#[derive(Debug, Clone, Copy)]
pub struct CardSpec<'a> {
    pub slot: u32,
    pub x: i32,
    pub y: i32,
    pub width_cells: u32,
    pub height_cells: u32,
    /// Card-specific raw argument string (OSC field 2).
    pub args: &'a str,
    /// Decoded payload (OSC field 3).
    pub payload: &'a [u8],
}

pub type CreateFn = Box<dyn Fn(&mut CardResourceManager, &CardSpec<'_>) -> Result<Card>>;

struct Registration {
    create: CreateFn,
    help: String,
}

/// Registry of card types, keyed by name.
pub struct CardFactory {
    creators: FxHashMap<String, Registration>,
}

impl Default for CardFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CardFactory {
    /// Empty factory (tests, embedders with a custom set).
    pub fn new() -> Self {
        Self {
            creators: FxHashMap::default(),
        }
    }

    /// Factory with the built-in card types registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register(
            "texture",
            TextureCard::help(),
            Box::new(|res, spec| {
                TextureCard::create(
                    res,
                    spec.slot,
                    spec.x,
                    spec.y,
                    spec.width_cells,
                    spec.height_cells,
                    spec.args,
                    spec.payload,
                )
                .map(Card::Texture)
            }),
        );
        factory.register(
            "plot",
            PlotCard::help(),
            Box::new(|res, spec| {
                PlotCard::create(
                    res,
                    spec.slot,
                    spec.x,
                    spec.y,
                    spec.width_cells,
                    spec.height_cells,
                    spec.args,
                    spec.payload,
                )
                .map(Card::Plot)
            }),
        );
        factory.register(
            "ydraw",
            YDrawCard::help(),
            Box::new(|res, spec| {
                YDrawCard::create(
                    res,
                    spec.slot,
                    spec.x,
                    spec.y,
                    spec.width_cells,
                    spec.height_cells,
                    spec.args,
                    spec.payload,
                )
                .map(Card::YDraw)
            }),
        );
        factory.register(
            "hdraw",
            HDrawCard::help(),
            Box::new(|res, spec| {
                HDrawCard::create(
                    res,
                    spec.slot,
                    spec.x,
                    spec.y,
                    spec.width_cells,
                    spec.height_cells,
                    spec.args,
                    spec.payload,
                )
                .map(Card::HDraw)
            }),
        );
        factory
    }

    /// Register a card type. Re-registering a name overwrites it.
    pub fn register(&mut self, name: &str, help: &str, create: CreateFn) {
        if self.creators.contains_key(name) {
            warn!(name, "overwriting existing card type");
        }
        self.creators.insert(
            name.to_string(),
            Registration {
                create,
                help: help.to_string(),
            },
        );
        info!(name, "registered card type");
    }

    pub fn has_card(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    pub fn registered_cards(&self) -> Vec<String> {
        let mut names: Vec<String> = self.creators.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn help(&self, name: &str) -> Option<&str> {
        self.creators.get(name).map(|r| r.help.as_str())
    }

    /// Instantiate a card. No card is registered anywhere on failure.
    pub fn create_card(
        &self,
        name: &str,
        res: &mut CardResourceManager,
        spec: &CardSpec<'_>,
    ) -> Result<Card> {
        let registration = self
            .creators
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("unknown card type: {name}")))?;

        info!(
            name,
            slot = spec.slot,
            x = spec.x,
            y = spec.y,
            w = spec.width_cells,
            h = spec.height_cells,
            "creating card"
        );
        (registration.create)(res, spec).inspect_err(|err| {
            error!(name, %err, "card creation failed");
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceConfig;

    fn spec<'a>(args: &'a str, payload: &'a [u8]) -> CardSpec<'a> {
        CardSpec {
            slot: 0,
            x: 0,
            y: 0,
            width_cells: 10,
            height_cells: 4,
            args,
            payload,
        }
    }

    #[test]
    fn builtins_are_registered() {
        let factory = CardFactory::with_builtins();
        assert_eq!(
            factory.registered_cards(),
            vec!["hdraw", "plot", "texture", "ydraw"]
        );
        assert!(factory.has_card("plot"));
        assert!(!factory.has_card("python"));
        assert!(factory.help("plot").unwrap().contains("--buffer"));
    }

    #[test]
    fn creates_by_type_name() {
        let factory = CardFactory::with_builtins();
        let mut res = CardResourceManager::private(1 << 16, ResourceConfig::default());
        let card = factory
            .create_card("plot", &mut res, &spec("--buffer w=4", &[]))
            .unwrap();
        assert_eq!(card.type_name(), "plot");
        assert!(card.needs_buffer());
        assert!(!card.needs_texture());
    }

    #[test]
    fn unknown_type_is_not_found() {
        let factory = CardFactory::with_builtins();
        let mut res = CardResourceManager::private(1 << 16, ResourceConfig::default());
        assert!(matches!(
            factory.create_card("nope", &mut res, &spec("", &[])),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn failed_creation_propagates_reason() {
        let factory = CardFactory::with_builtins();
        let mut res = CardResourceManager::private(1 << 16, ResourceConfig::default());
        // texture requires --size
        let err = factory
            .create_card("texture", &mut res, &spec("", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("--size"));
    }
}
