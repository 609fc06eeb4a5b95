//! Typed input events and the synchronous dispatch pipeline.
//!
//! Every user input the terminal can synthesize has an [`Event`] variant;
//! the RPC EventLoop channel and the windowing callbacks both feed the same
//! [`EventLoop`], so injected input is indistinguishable from real input
//! downstream. Dispatch is synchronous on the main thread: listeners are
//! asked in registration order until one reports the event handled.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;

/// Pane split direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

impl Orientation {
    pub fn from_wire(value: i64) -> Self {
        if value == 1 {
            Orientation::Vertical
        } else {
            Orientation::Horizontal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    KeyDown { key: i64, mods: i64, scancode: i64 },
    KeyUp { key: i64, mods: i64, scancode: i64 },
    Char { codepoint: u32, mods: i64 },
    MouseDown { x: f64, y: f64, button: i64 },
    MouseUp { x: f64, y: f64, button: i64 },
    MouseMove { x: f64, y: f64 },
    MouseDrag { x: f64, y: f64, button: i64 },
    Scroll { x: f64, y: f64, dx: f64, dy: f64, mods: i64 },
    SetFocus { object_id: u64 },
    Resize { width: f64, height: f64 },
    ContextMenuAction { object_id: u64, action: String, row: i64, col: i64 },
    CardMouseDown { target_id: u64, x: f64, y: f64, button: i64 },
    CardMouseUp { target_id: u64, x: f64, y: f64, button: i64 },
    CardMouseMove { target_id: u64, x: f64, y: f64 },
    CardScroll { target_id: u64, x: f64, y: f64, dx: f64, dy: f64 },
    Close { object_id: u64 },
    Split { object_id: u64, orientation: Orientation },
}

/// Receives dispatched events; returns whether the event was handled.
pub trait EventListener {
    fn on_event(&mut self, event: &Event) -> Result<bool>;
}

/// Synchronous event dispatch to registered listeners.
#[derive(Default)]
pub struct EventLoop {
    listeners: Vec<Rc<RefCell<dyn EventListener>>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Rc<RefCell<dyn EventListener>>) {
        self.listeners.push(listener);
    }

    /// Offer the event to listeners in order; the first to handle it wins.
    pub fn dispatch(&mut self, event: &Event) -> Result<bool> {
        for listener in &self.listeners {
            if listener.borrow_mut().on_event(event)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        seen: Vec<Event>,
        handles: bool,
    }

    impl EventListener for Recorder {
        fn on_event(&mut self, event: &Event) -> Result<bool> {
            self.seen.push(event.clone());
            Ok(self.handles)
        }
    }

    #[test]
    fn first_handler_wins() {
        let first = Rc::new(RefCell::new(Recorder {
            seen: vec![],
            handles: true,
        }));
        let second = Rc::new(RefCell::new(Recorder {
            seen: vec![],
            handles: true,
        }));
        let mut events = EventLoop::new();
        events.add_listener(first.clone());
        events.add_listener(second.clone());

        let handled = events
            .dispatch(&Event::KeyDown {
                key: 65,
                mods: 0,
                scancode: 0,
            })
            .unwrap();
        assert!(handled);
        assert_eq!(first.borrow().seen.len(), 1);
        assert!(second.borrow().seen.is_empty());
    }

    #[test]
    fn unhandled_events_visit_every_listener() {
        let listener = Rc::new(RefCell::new(Recorder {
            seen: vec![],
            handles: false,
        }));
        let mut events = EventLoop::new();
        events.add_listener(listener.clone());

        let handled = events
            .dispatch(&Event::MouseMove { x: 1.0, y: 2.0 })
            .unwrap();
        assert!(!handled);
        assert_eq!(listener.borrow().seen.len(), 1);
    }
}
