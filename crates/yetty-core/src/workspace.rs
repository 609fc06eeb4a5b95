//! Workspace tree: panes at the leaves, splits at the branches.
//!
//! The card core is agnostic to the layout algorithm; the tree exists as an
//! addressable destination for RPC events (`close`, `split`, `set_focus`)
//! and as the source of the `ui_tree` YAML dump.

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, EventListener, Orientation};

/// Leaf of the workspace tree.
#[derive(Debug, Clone, Serialize)]
pub struct Pane {
    pub id: u64,
    pub title: String,
}

/// Workspace tree node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tile {
    Pane(Pane),
    Split {
        id: u64,
        orientation: Orientation,
        children: Vec<Tile>,
    },
}

impl Tile {
    pub fn id(&self) -> u64 {
        match self {
            Tile::Pane(pane) => pane.id,
            Tile::Split { id, .. } => *id,
        }
    }

    fn contains(&self, target: u64) -> bool {
        match self {
            Tile::Pane(pane) => pane.id == target,
            Tile::Split { id, children, .. } => {
                *id == target || children.iter().any(|c| c.contains(target))
            }
        }
    }

    fn first_pane_id(&self) -> u64 {
        match self {
            Tile::Pane(pane) => pane.id,
            Tile::Split { children, .. } => children
                .first()
                .map(Tile::first_pane_id)
                .unwrap_or_default(),
        }
    }
}

/// One workspace: a tile tree with a focused object.
#[derive(Debug, Serialize)]
pub struct Workspace {
    root: Tile,
    focused: u64,
    #[serde(skip)]
    next_id: u64,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    /// A workspace starts as a single pane.
    pub fn new() -> Self {
        Self {
            root: Tile::Pane(Pane {
                id: 1,
                title: "shell".to_string(),
            }),
            focused: 1,
            next_id: 2,
        }
    }

    pub fn root(&self) -> &Tile {
        &self.root
    }

    pub fn focused(&self) -> u64 {
        self.focused
    }

    pub fn set_focus(&mut self, object_id: u64) -> bool {
        if self.root.contains(object_id) {
            self.focused = object_id;
            true
        } else {
            false
        }
    }

    /// Split the pane `object_id`, producing a new sibling pane. Returns the
    /// new pane's id.
    pub fn split(&mut self, object_id: u64, orientation: Orientation) -> Result<u64> {
        let new_pane = Pane {
            id: self.next_id,
            title: "shell".to_string(),
        };
        let split_id = self.next_id + 1;
        self.next_id += 2;

        let new_id = new_pane.id;
        if Self::split_in(&mut self.root, object_id, orientation, new_pane, split_id) {
            debug!(object_id, new_id, "pane split");
            Ok(new_id)
        } else {
            Err(Error::NotFound(format!("pane {object_id}")))
        }
    }

    fn split_in(
        tile: &mut Tile,
        target: u64,
        orientation: Orientation,
        new_pane: Pane,
        split_id: u64,
    ) -> bool {
        match tile {
            Tile::Pane(pane) if pane.id == target => {
                let old = Tile::Pane(pane.clone());
                *tile = Tile::Split {
                    id: split_id,
                    orientation,
                    children: vec![old, Tile::Pane(new_pane)],
                };
                true
            }
            Tile::Pane(_) => false,
            Tile::Split { children, .. } => {
                for child in children {
                    // Recurse; the pane is replaced in place.
                    if child.contains(target) {
                        return Self::split_in(child, target, orientation, new_pane, split_id);
                    }
                }
                false
            }
        }
    }

    /// Close a pane (or a whole split subtree). The last pane cannot close.
    pub fn close(&mut self, object_id: u64) -> Result<()> {
        if self.root.id() == object_id {
            return Err(Error::InvalidArgument("cannot close the last pane".into()));
        }
        if !Self::close_in(&mut self.root, object_id) {
            return Err(Error::NotFound(format!("object {object_id}")));
        }
        if !self.root.contains(self.focused) {
            self.focused = self.root.first_pane_id();
        }
        debug!(object_id, "pane closed");
        Ok(())
    }

    fn close_in(tile: &mut Tile, target: u64) -> bool {
        let Tile::Split { children, .. } = tile else {
            return false;
        };
        if let Some(pos) = children.iter().position(|c| c.id() == target) {
            children.remove(pos);
            // A split with one child collapses to that child.
            if children.len() == 1 {
                if let Some(only) = children.pop() {
                    *tile = only;
                }
            }
            return true;
        }
        children.iter_mut().any(|c| Self::close_in(c, target))
    }

    /// YAML dump of the tree, served by the `ui_tree` RPC method.
    pub fn as_yaml(&self) -> Result<String> {
        serde_yml::to_string(self).map_err(|e| Error::Protocol(format!("ui_tree: {e}")))
    }
}

impl EventListener for Workspace {
    fn on_event(&mut self, event: &Event) -> Result<bool> {
        match event {
            Event::SetFocus { object_id } => Ok(self.set_focus(*object_id)),
            Event::Split {
                object_id,
                orientation,
            } => {
                self.split(*object_id, *orientation)?;
                Ok(true)
            }
            Event::Close { object_id } => {
                self.close(*object_id)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_close_restores_single_pane() {
        let mut ws = Workspace::new();
        let new_pane = ws.split(1, Orientation::Horizontal).unwrap();
        assert!(matches!(ws.root(), Tile::Split { .. }));

        ws.close(new_pane).unwrap();
        assert!(matches!(ws.root(), Tile::Pane(Pane { id: 1, .. })));
    }

    #[test]
    fn cannot_close_the_last_pane() {
        let mut ws = Workspace::new();
        assert!(matches!(ws.close(1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn closing_the_focused_pane_moves_focus() {
        let mut ws = Workspace::new();
        let new_pane = ws.split(1, Orientation::Vertical).unwrap();
        assert!(ws.set_focus(new_pane));
        ws.close(new_pane).unwrap();
        assert_eq!(ws.focused(), 1);
    }

    #[test]
    fn nested_splits_resolve_targets() {
        let mut ws = Workspace::new();
        let second = ws.split(1, Orientation::Horizontal).unwrap();
        let third = ws.split(second, Orientation::Vertical).unwrap();
        assert!(ws.set_focus(third));
        ws.close(second).unwrap();
        assert!(ws.root().contains(third));
        assert!(!ws.root().contains(second));
    }

    #[test]
    fn unknown_targets_are_not_found() {
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.split(99, Orientation::Horizontal),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(ws.close(99), Err(Error::NotFound(_))));
        assert!(!ws.set_focus(99));
    }

    #[test]
    fn yaml_dump_contains_the_tree() {
        let mut ws = Workspace::new();
        ws.split(1, Orientation::Horizontal).unwrap();
        let yaml = ws.as_yaml().unwrap();
        assert!(yaml.contains("split"));
        assert!(yaml.contains("orientation"));
        assert!(yaml.contains("shell"));
    }

    #[test]
    fn events_drive_the_tree() {
        let mut ws = Workspace::new();
        ws.on_event(&Event::Split {
            object_id: 1,
            orientation: Orientation::Vertical,
        })
        .unwrap();
        assert!(matches!(ws.root(), Tile::Split { .. }));

        let handled = ws.on_event(&Event::MouseMove { x: 0.0, y: 0.0 }).unwrap();
        assert!(!handled);
    }
}
