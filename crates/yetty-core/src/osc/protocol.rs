//! OSC card-command dispatcher.
//!
//! Takes complete sequence bodies framed by the scanner, parses them and
//! applies them to a screen's card system. Every command produces a reply
//! string written back to the child on the TTY (empty = silent success,
//! `error: ...` on failure).

use tracing::{debug, info, warn};

use crate::cards::factory::{CardFactory, CardSpec};
use crate::names::NameGenerator;
use crate::osc::command::{
    CommandKind, HelpArgs, ListArgs, OscCommand, OscCommandParser, OscResponse, RunArgs,
    TargetArgs,
};
use crate::resources::CardResourceManager;
use crate::screen::{CardEntry, Screen};

/// Card-command protocol engine: parser, factory routing, id and name
/// generation.
pub struct OscCardProtocol {
    parser: OscCommandParser,
    factory: CardFactory,
    names: NameGenerator,
}

impl Default for OscCardProtocol {
    fn default() -> Self {
        Self::new(CardFactory::with_builtins())
    }
}

impl OscCardProtocol {
    pub fn new(factory: CardFactory) -> Self {
        Self {
            parser: OscCommandParser::new(),
            factory,
            names: NameGenerator::new(),
        }
    }

    pub fn factory(&self) -> &CardFactory {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut CardFactory {
        &mut self.factory
    }

    /// Handle one complete sequence body (between `ESC ]` and ST).
    /// Returns the reply to write on the TTY.
    pub fn handle_sequence(
        &mut self,
        body: &str,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        let command = self.parser.parse(body);
        if let Some(error) = &command.error {
            debug!(%error, "rejected card command");
            return OscResponse::error(error);
        }
        self.dispatch(&command, screen, res)
    }

    fn dispatch(
        &mut self,
        command: &OscCommand,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        match &command.kind {
            CommandKind::Run(run) => self.cmd_run(run, command, screen, res),
            CommandKind::List(list) => self.cmd_list(list, screen),
            CommandKind::Cards => OscResponse::type_list(&self.factory.registered_cards()),
            CommandKind::Kill(target) => self.cmd_kill(target, screen, res),
            CommandKind::Stop(target) => self.cmd_set_running(target, false, screen, res),
            CommandKind::Start(target) => self.cmd_set_running(target, true, screen, res),
            CommandKind::Update(target) => self.cmd_update(target, command, screen, res),
            CommandKind::Help(help) => self.cmd_help(help),
            CommandKind::Unknown => OscResponse::error("unknown command"),
        }
    }

    fn cmd_run(
        &mut self,
        run: &RunArgs,
        command: &OscCommand,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        if !self.factory.has_card(&run.card) {
            return OscResponse::error(&format!("unknown card type: {}", run.card));
        }

        let id = self.unique_id(screen);
        let name = if run.name.is_empty() {
            self.unique_name(res)
        } else {
            run.name.clone()
        };

        let (x, y, width_cells, height_cells) =
            screen.resolve_geometry(run.x, run.y, run.width, run.height, run.relative);

        let slot = match res.allocate_slot() {
            Ok(slot) => slot,
            Err(err) => return OscResponse::error(&err.to_string()),
        };

        let spec = CardSpec {
            slot,
            x,
            y,
            width_cells,
            height_cells,
            args: &command.card_args,
            payload: &command.payload,
        };
        let card = match self.factory.create_card(&run.card, res, &spec) {
            Ok(card) => card,
            Err(err) => {
                // No card may be observable after a failed create.
                res.release_slot(slot);
                return OscResponse::error(&err.to_string());
            }
        };

        res.register_named_card(&name, slot);
        screen.insert_card(CardEntry {
            id: id.clone(),
            card,
            running: true,
        });
        info!(id, name, slot, card = %run.card, "card running");
        OscResponse::success("")
    }

    fn cmd_list(&self, list: &ListArgs, screen: &Screen) -> String {
        OscResponse::card_list(&screen.list_entries(list.all))
    }

    fn cmd_kill(
        &mut self,
        target: &TargetArgs,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        let mut indices = match self.resolve_targets(target, screen, res) {
            Ok(indices) => indices,
            Err(error) => return OscResponse::error(&error),
        };
        // Remove back-to-front so indices stay valid.
        indices.sort_unstable_by(|a, b| b.cmp(a));
        for index in indices {
            let mut entry = screen.remove_card_at(index);
            if let Err(err) = entry.card.dispose(res) {
                warn!(id = %entry.id, %err, "card dispose failed");
            }
            res.release_slot(entry.card.slot());
            info!(id = %entry.id, "card killed");
        }
        OscResponse::success("")
    }

    fn cmd_set_running(
        &mut self,
        target: &TargetArgs,
        running: bool,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        let indices = match self.resolve_targets(target, screen, res) {
            Ok(indices) => indices,
            Err(error) => return OscResponse::error(&error),
        };
        for index in indices {
            screen.cards_mut()[index].running = running;
        }
        OscResponse::success("")
    }

    fn cmd_update(
        &mut self,
        target: &TargetArgs,
        command: &OscCommand,
        screen: &mut Screen,
        res: &mut CardResourceManager,
    ) -> String {
        let indices = match self.resolve_targets(target, screen, res) {
            Ok(indices) => indices,
            Err(error) => return OscResponse::error(&error),
        };
        for index in indices {
            let entry = &mut screen.cards_mut()[index];
            if let Err(err) = entry.card.update(&command.card_args, &command.payload) {
                return OscResponse::error(&err.to_string());
            }
        }
        OscResponse::success("")
    }

    fn cmd_help(&self, help: &HelpArgs) -> String {
        match self.factory.help(&help.card) {
            Some(text) => OscResponse::success(text),
            None => OscResponse::error(&format!("unknown card type: {}", help.card)),
        }
    }

    /// Resolve a target selector to entry indices. Unknown ids and names are
    /// errors; a type with no live cards matches nothing silently.
    fn resolve_targets(
        &self,
        target: &TargetArgs,
        screen: &Screen,
        res: &CardResourceManager,
    ) -> Result<Vec<usize>, String> {
        let mut indices = Vec::new();
        if let Some(id) = &target.id {
            match screen.index_by_id(id) {
                Some(index) => indices.push(index),
                None => return Err(format!("no card with id {id}")),
            }
        }
        if let Some(name) = &target.name {
            let slot = res
                .slot_by_name(name)
                .ok_or_else(|| format!("no card named {name}"))?;
            match screen.index_by_slot(slot) {
                Some(index) => indices.push(index),
                None => return Err(format!("no card named {name}")),
            }
        }
        if let Some(card_type) = &target.card {
            indices.extend(screen.indices_by_type(card_type));
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    /// Roll an id that is not in use on this screen.
    fn unique_id(&mut self, screen: &Screen) -> String {
        loop {
            let id = self.parser.generate_id();
            if screen.index_by_id(&id).is_none() {
                return id;
            }
        }
    }

    /// Roll a registry-unique auto name, suffixing a digit on collision.
    fn unique_name(&mut self, res: &CardResourceManager) -> String {
        let mut retry = 0;
        loop {
            let name = self.names.generate(retry);
            if res.slot_by_name(&name).is_none() {
                return name;
            }
            retry += 1;
        }
    }
}
