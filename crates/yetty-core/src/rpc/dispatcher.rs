//! Channel routing for the terminal's RPC endpoint.
//!
//! Channel 0 (EventLoop) decodes typed input events and feeds them through
//! the same synchronous pipeline window callbacks use; channel 1
//! (CardStream) serves shared-memory discovery and buffer lookups. Both
//! method sets are closed: anything else is answered with
//! `unknown method: <name>`.

use std::cell::RefCell;
use std::rc::Rc;

use rmpv::Value;
use tracing::debug;

use crate::event::{Event, EventLoop, Orientation};
use crate::resources::CardResourceManager;
use crate::rpc::server::RpcDispatch;
use crate::rpc::{field_f64, field_i64, field_str, field_u64, map_field, Channel, RpcMessage};
use crate::screen::Screen;
use crate::workspace::Workspace;

/// Dispatcher wired to the terminal's subsystems. All references are
/// single-threaded (`Rc<RefCell<..>>`): handlers run on the main loop
/// between frames, never concurrently with rendering.
pub struct CardSystemDispatcher {
    events: Rc<RefCell<EventLoop>>,
    workspace: Rc<RefCell<Workspace>>,
    screen: Rc<RefCell<Screen>>,
    resources: Rc<RefCell<CardResourceManager>>,
}

impl CardSystemDispatcher {
    pub fn new(
        events: Rc<RefCell<EventLoop>>,
        workspace: Rc<RefCell<Workspace>>,
        screen: Rc<RefCell<Screen>>,
        resources: Rc<RefCell<CardResourceManager>>,
    ) -> Self {
        Self {
            events,
            workspace,
            screen,
            resources,
        }
    }

    fn dispatch_event(&self, event: Event) -> Result<Value, String> {
        let handled = self
            .events
            .borrow_mut()
            .dispatch(&event)
            .map_err(|e| e.to_string())?;
        Ok(Value::Boolean(handled))
    }

    fn handle_event_loop(&mut self, msg: &RpcMessage) -> Result<Value, String> {
        let p = &msg.params;
        match msg.method.as_str() {
            "key_down" => self.dispatch_event(Event::KeyDown {
                key: field_i64(p, "key")?,
                mods: opt_i64(p, "mods"),
                scancode: opt_i64(p, "scancode"),
            }),
            "key_up" => self.dispatch_event(Event::KeyUp {
                key: field_i64(p, "key")?,
                mods: opt_i64(p, "mods"),
                scancode: opt_i64(p, "scancode"),
            }),
            "char" => self.dispatch_event(Event::Char {
                codepoint: field_u64(p, "codepoint")? as u32,
                mods: opt_i64(p, "mods"),
            }),
            "mouse_down" => self.dispatch_event(Event::MouseDown {
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                button: field_i64(p, "button")?,
            }),
            "mouse_up" => self.dispatch_event(Event::MouseUp {
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                button: field_i64(p, "button")?,
            }),
            "mouse_move" => self.dispatch_event(Event::MouseMove {
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
            }),
            "mouse_drag" => self.dispatch_event(Event::MouseDrag {
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                button: field_i64(p, "button")?,
            }),
            "scroll" => self.dispatch_event(Event::Scroll {
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                dx: field_f64(p, "dx")?,
                dy: field_f64(p, "dy")?,
                mods: opt_i64(p, "mods"),
            }),
            "set_focus" => self.dispatch_event(Event::SetFocus {
                object_id: field_u64(p, "object_id")?,
            }),
            "resize" => self.dispatch_event(Event::Resize {
                width: field_f64(p, "width")?,
                height: field_f64(p, "height")?,
            }),
            "context_menu_action" => self.dispatch_event(Event::ContextMenuAction {
                object_id: field_u64(p, "object_id")?,
                action: field_str(p, "action")?.to_string(),
                row: opt_i64(p, "row"),
                col: opt_i64(p, "col"),
            }),
            "card_mouse_down" => self.dispatch_event(Event::CardMouseDown {
                target_id: field_u64(p, "target_id")?,
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                button: field_i64(p, "button")?,
            }),
            "card_mouse_up" => self.dispatch_event(Event::CardMouseUp {
                target_id: field_u64(p, "target_id")?,
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                button: field_i64(p, "button")?,
            }),
            "card_mouse_move" => self.dispatch_event(Event::CardMouseMove {
                target_id: field_u64(p, "target_id")?,
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
            }),
            "card_scroll" => self.dispatch_event(Event::CardScroll {
                target_id: field_u64(p, "target_id")?,
                x: field_f64(p, "x")?,
                y: field_f64(p, "y")?,
                dx: field_f64(p, "dx")?,
                dy: field_f64(p, "dy")?,
            }),
            "close" => self.dispatch_event(Event::Close {
                object_id: field_u64(p, "object_id")?,
            }),
            "split" => self.dispatch_event(Event::Split {
                object_id: field_u64(p, "object_id")?,
                orientation: Orientation::from_wire(opt_i64(p, "orientation")),
            }),
            "ui_tree" => {
                let yaml = self
                    .workspace
                    .borrow()
                    .as_yaml()
                    .map_err(|e| e.to_string())?;
                Ok(Value::from(yaml))
            }
            other => Err(format!("unknown method: {other}")),
        }
    }

    fn handle_card_stream(&mut self, msg: &RpcMessage) -> Result<Value, String> {
        let p = &msg.params;
        match msg.method.as_str() {
            "stream_connect" => {
                let resources = self.resources.borrow();
                let (name, size) = resources
                    .buffers()
                    .shm_info()
                    .ok_or_else(|| "streaming disabled: no shared memory region".to_string())?;
                Ok(Value::Map(vec![
                    (Value::from("data_shm"), Value::from(name)),
                    (Value::from("data_size"), Value::from(size)),
                ]))
            }
            "stream_get_buffer" => {
                let scope = field_str(p, "scope")?;
                let resources = self.resources.borrow();
                let slot = self.resolve_slot(p, &resources)?;
                // No allocation yet is not an error: size 0 tells the client
                // to retry after the card's first frame.
                let (offset, size) = resources.buffers().lookup(slot, scope).unwrap_or((0, 0));
                Ok(Value::Map(vec![
                    (Value::from("offset"), Value::from(offset)),
                    (Value::from("size"), Value::from(size)),
                ]))
            }
            "stream_mark_dirty" => {
                // Advisory: the seqlock already guarantees consistency, this
                // only requests an expedited frame.
                debug!(params = %p, "stream_mark_dirty");
                self.resources.borrow_mut().request_render();
                Ok(Value::Nil)
            }
            "stream_disconnect" => Ok(Value::Nil),
            "buffers_list" => {
                let resources = self.resources.borrow();
                let rows = resources
                    .buffers()
                    .all_buffers()
                    .into_iter()
                    .map(|info| {
                        Value::Map(vec![
                            (Value::from("slot_index"), Value::from(info.slot_index)),
                            (
                                Value::from("card"),
                                Value::from(resources.name_by_slot(info.slot_index)),
                            ),
                            (Value::from("name"), Value::from(info.scope)),
                            (Value::from("offset"), Value::from(info.offset)),
                            (Value::from("size"), Value::from(info.size)),
                        ])
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            "cards_list" => {
                let resources = self.resources.borrow();
                let screen = self.screen.borrow();
                let rows = screen
                    .cards()
                    .iter()
                    .map(|entry| {
                        let slot = entry.card.slot();
                        Value::Map(vec![
                            (Value::from("slot_index"), Value::from(slot)),
                            (Value::from("name"), Value::from(resources.name_by_slot(slot))),
                            (Value::from("type"), Value::from(entry.card.type_name())),
                        ])
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            other => Err(format!("unknown method: {other}")),
        }
    }

    /// `stream_get_buffer` addressing: by registered name or by raw slot.
    fn resolve_slot(
        &self,
        params: &Value,
        resources: &CardResourceManager,
    ) -> Result<u32, String> {
        if let Some(name) = map_field(params, "name").and_then(Value::as_str) {
            return resources
                .slot_by_name(name)
                .ok_or_else(|| format!("no card named {name}"));
        }
        let slot = field_u64(params, "slot_index")? as u32;
        if !resources.is_slot_live(slot) {
            return Err(format!("no card in slot {slot}"));
        }
        Ok(slot)
    }
}

impl RpcDispatch for CardSystemDispatcher {
    fn handle(&mut self, msg: &RpcMessage) -> Result<Value, String> {
        match Channel::from_wire(msg.channel) {
            Some(Channel::EventLoop) => self.handle_event_loop(msg),
            Some(Channel::CardStream) => self.handle_card_stream(msg),
            None => Err(format!("unknown channel: {}", msg.channel)),
        }
    }
}

fn opt_i64(params: &Value, key: &str) -> i64 {
    map_field(params, key).and_then(Value::as_i64).unwrap_or(0)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use crate::event::EventListener;
    use crate::osc::OscCardProtocol;
    use crate::resources::ResourceConfig;
    use crate::rpc::MessageType;

    struct Recorder {
        seen: Vec<Event>,
    }

    impl EventListener for Recorder {
        fn on_event(&mut self, event: &Event) -> CoreResult<bool> {
            self.seen.push(event.clone());
            Ok(true)
        }
    }

    struct Fixture {
        dispatcher: CardSystemDispatcher,
        recorder: Rc<RefCell<Recorder>>,
        screen: Rc<RefCell<Screen>>,
        resources: Rc<RefCell<CardResourceManager>>,
    }

    fn fixture() -> Fixture {
        let events = Rc::new(RefCell::new(EventLoop::new()));
        let workspace = Rc::new(RefCell::new(Workspace::new()));
        let screen = Rc::new(RefCell::new(Screen::new(80, 24)));
        let resources = Rc::new(RefCell::new(CardResourceManager::private(
            1 << 16,
            ResourceConfig::default(),
        )));

        let recorder = Rc::new(RefCell::new(Recorder { seen: vec![] }));
        events.borrow_mut().add_listener(recorder.clone());

        Fixture {
            dispatcher: CardSystemDispatcher::new(
                events,
                workspace,
                screen.clone(),
                resources.clone(),
            ),
            recorder,
            screen,
            resources,
        }
    }

    fn request(channel: u32, method: &str, params: Vec<(Value, Value)>) -> RpcMessage {
        RpcMessage {
            msg_type: MessageType::Request,
            msgid: 1,
            channel,
            method: method.to_string(),
            params: Value::Map(params),
        }
    }

    #[test]
    fn key_down_reaches_the_event_pipeline() {
        let mut fx = fixture();
        let reply = fx
            .dispatcher
            .handle(&request(
                0,
                "key_down",
                vec![
                    (Value::from("key"), Value::from(65)),
                    (Value::from("mods"), Value::from(0)),
                    (Value::from("scancode"), Value::from(0)),
                ],
            ))
            .unwrap();
        assert_eq!(reply, Value::Boolean(true));
        assert_eq!(
            fx.recorder.borrow().seen[0],
            Event::KeyDown {
                key: 65,
                mods: 0,
                scancode: 0
            }
        );
    }

    #[test]
    fn unknown_method_and_channel_are_errors() {
        let mut fx = fixture();
        assert_eq!(
            fx.dispatcher.handle(&request(0, "teleport", vec![])),
            Err("unknown method: teleport".to_string())
        );
        assert_eq!(
            fx.dispatcher.handle(&request(1, "teleport", vec![])),
            Err("unknown method: teleport".to_string())
        );
        assert_eq!(
            fx.dispatcher.handle(&request(9, "ping", vec![])),
            Err("unknown channel: 9".to_string())
        );
    }

    #[test]
    fn missing_fields_are_reported() {
        let mut fx = fixture();
        let err = fx
            .dispatcher
            .handle(&request(0, "mouse_down", vec![]))
            .unwrap_err();
        assert!(err.contains("x"), "unexpected error: {err}");
    }

    #[test]
    fn ui_tree_returns_yaml() {
        let mut fx = fixture();
        let reply = fx.dispatcher.handle(&request(0, "ui_tree", vec![])).unwrap();
        assert!(reply.as_str().unwrap().contains("shell"));
    }

    #[test]
    fn stream_connect_requires_shared_memory() {
        let mut fx = fixture();
        let err = fx
            .dispatcher
            .handle(&request(1, "stream_connect", vec![]))
            .unwrap_err();
        assert!(err.contains("streaming disabled"));
    }

    fn host_named_plot(fx: &Fixture, name: &str) -> u32 {
        let mut protocol = OscCardProtocol::default();
        let mut screen = fx.screen.borrow_mut();
        let mut resources = fx.resources.borrow_mut();
        let reply = protocol.handle_sequence(
            &format!("666666;run -c plot --name {name};--buffer waveform=400;"),
            &mut screen,
            &mut resources,
        );
        assert_eq!(reply, "");
        screen.cards().last().unwrap().card.slot()
    }

    #[test]
    fn stream_get_buffer_before_first_frame_is_size_zero() {
        let mut fx = fixture();
        host_named_plot(&fx, "audio");
        let reply = fx
            .dispatcher
            .handle(&request(
                1,
                "stream_get_buffer",
                vec![
                    (Value::from("name"), Value::from("audio")),
                    (Value::from("scope"), Value::from("waveform")),
                ],
            ))
            .unwrap();
        assert_eq!(map_field(&reply, "size").unwrap().as_u64(), Some(0));
    }

    #[test]
    fn stream_get_buffer_resolves_after_a_frame() {
        let mut fx = fixture();
        let slot = host_named_plot(&fx, "audio");
        fx.screen
            .borrow_mut()
            .run_frame(0.0, &mut fx.resources.borrow_mut())
            .unwrap();

        let by_name = fx
            .dispatcher
            .handle(&request(
                1,
                "stream_get_buffer",
                vec![
                    (Value::from("name"), Value::from("audio")),
                    (Value::from("scope"), Value::from("waveform")),
                ],
            ))
            .unwrap();
        assert_eq!(map_field(&by_name, "size").unwrap().as_u64(), Some(1600));

        let by_slot = fx
            .dispatcher
            .handle(&request(
                1,
                "stream_get_buffer",
                vec![
                    (Value::from("slot_index"), Value::from(slot)),
                    (Value::from("scope"), Value::from("waveform")),
                ],
            ))
            .unwrap();
        assert_eq!(by_slot, by_name);

        // Back-to-back calls with no intervening lifecycle event agree.
        let again = fx
            .dispatcher
            .handle(&request(
                1,
                "stream_get_buffer",
                vec![
                    (Value::from("name"), Value::from("audio")),
                    (Value::from("scope"), Value::from("waveform")),
                ],
            ))
            .unwrap();
        assert_eq!(again, by_name);
    }

    #[test]
    fn stream_get_buffer_unknown_name_is_an_error() {
        let mut fx = fixture();
        let err = fx
            .dispatcher
            .handle(&request(
                1,
                "stream_get_buffer",
                vec![
                    (Value::from("name"), Value::from("ghost")),
                    (Value::from("scope"), Value::from("waveform")),
                ],
            ))
            .unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn mark_dirty_requests_a_render() {
        let mut fx = fixture();
        fx.dispatcher
            .handle(&request(1, "stream_mark_dirty", vec![]))
            .unwrap();
        assert!(fx.resources.borrow_mut().take_render_requested());
    }

    #[test]
    fn diagnostics_list_cards_and_buffers() {
        let mut fx = fixture();
        host_named_plot(&fx, "audio");
        fx.screen
            .borrow_mut()
            .run_frame(0.0, &mut fx.resources.borrow_mut())
            .unwrap();

        let cards = fx
            .dispatcher
            .handle(&request(1, "cards_list", vec![]))
            .unwrap();
        let cards = cards.as_array().unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(map_field(&cards[0], "type").unwrap().as_str(), Some("plot"));
        assert_eq!(map_field(&cards[0], "name").unwrap().as_str(), Some("audio"));

        let buffers = fx
            .dispatcher
            .handle(&request(1, "buffers_list", vec![]))
            .unwrap();
        let buffers = buffers.as_array().unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(
            map_field(&buffers[0], "name").unwrap().as_str(),
            Some("waveform")
        );
        assert_eq!(
            map_field(&buffers[0], "card").unwrap().as_str(),
            Some("audio")
        );
    }
}
