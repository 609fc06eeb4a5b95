//! Top-level assembly of the card subsystem for one terminal instance.
//!
//! [`CardTerminal`] owns every subsystem explicitly (no globals) and wires
//! them together the way the hosting terminal's main loop consumes them:
//! PTY bytes go through [`feed`](CardTerminal::feed), which uses the OSC
//! scanner to decide byte by byte whether to pass data through to the
//! terminal parser or hold it back as a card command; each loop iteration
//! calls [`tick`](CardTerminal::tick) to pump the RPC socket and run the
//! per-frame card protocol.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use tracing::info;

use crate::cards::CardFactory;
use crate::config::Config;
use crate::error::Result;
use crate::event::EventLoop;
use crate::osc::scanner::frame_body;
use crate::osc::{OscCardProtocol, OscScanner};
use crate::resources::{CardResourceManager, ResourceConfig};
use crate::rpc::{socket_path_for_pid, CardSystemDispatcher, RpcServer};
use crate::screen::Screen;
use crate::shm::SharedMemoryRegion;
use crate::workspace::Workspace;

/// Output of one [`feed`](CardTerminal::feed) call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FeedResult {
    /// Bytes to hand to the terminal parser (card commands removed,
    /// foreign OSC sequences preserved).
    pub passthrough: Vec<u8>,
    /// Replies to write back to the child on the TTY, in order.
    pub replies: Vec<String>,
}

/// One terminal's card subsystem: screen, resources, OSC protocol, RPC
/// endpoint.
pub struct CardTerminal {
    pub events: Rc<RefCell<EventLoop>>,
    pub workspace: Rc<RefCell<Workspace>>,
    pub screen: Rc<RefCell<Screen>>,
    pub resources: Rc<RefCell<CardResourceManager>>,
    protocol: OscCardProtocol,
    scanner: OscScanner,
    held: Vec<u8>,
    server: RpcServer,
    dispatcher: CardSystemDispatcher,
}

impl CardTerminal {
    /// Assemble the subsystem for a `cols` x `rows` screen, with the RPC
    /// socket at the standard per-pid path. With streaming enabled the card
    /// arena is a shared region named `yetty-shm-data-<pid>`; failure to
    /// create it (or to bind the RPC socket) is fatal and surfaces here.
    pub fn new(config: &Config, cols: u32, rows: u32) -> Result<Self> {
        let socket_path = socket_path_for_pid(std::process::id())?;
        Self::with_socket_path(config, cols, rows, &socket_path)
    }

    /// As [`new`](Self::new), with an explicit socket path (embedders and
    /// tests that host several instances in one process).
    pub fn with_socket_path(
        config: &Config,
        cols: u32,
        rows: u32,
        socket_path: &Path,
    ) -> Result<Self> {
        let pid = std::process::id();
        let resource_config = ResourceConfig::default();
        let shm_size = config.streaming_shm_size() as usize;

        let resources = if config.streaming_enabled() {
            let region = SharedMemoryRegion::create(&format!("yetty-shm-data-{pid}"), shm_size)?;
            CardResourceManager::with_shm(region, resource_config)?
        } else {
            CardResourceManager::private(shm_size, resource_config)
        };
        let resources = Rc::new(RefCell::new(resources));

        let events = Rc::new(RefCell::new(EventLoop::new()));
        let workspace = Rc::new(RefCell::new(Workspace::new()));
        let screen = Rc::new(RefCell::new(Screen::new(cols, rows)));
        events.borrow_mut().add_listener(workspace.clone());

        let server = RpcServer::bind(socket_path)?;
        let dispatcher = CardSystemDispatcher::new(
            events.clone(),
            workspace.clone(),
            screen.clone(),
            resources.clone(),
        );

        info!(pid, cols, rows, streaming = config.streaming_enabled(), "card terminal up");
        Ok(Self {
            events,
            workspace,
            screen,
            resources,
            protocol: OscCardProtocol::new(CardFactory::with_builtins()),
            scanner: OscScanner::new(),
            held: Vec::new(),
            server,
            dispatcher,
        })
    }

    pub fn socket_path(&self) -> &Path {
        self.server.socket_path()
    }

    /// Scan child output, splitting card commands out of the stream.
    ///
    /// Bytes of an in-progress escape sequence are held back until the
    /// scanner sees its end; a completed sequence is either dispatched (our
    /// vendor id) or passed through unmodified (anything else). Replies are
    /// emitted as soon as the terminator is consumed, before any later
    /// bytes are processed.
    pub fn feed(&mut self, bytes: &[u8]) -> FeedResult {
        let mut out = FeedResult::default();
        for &byte in bytes {
            let was_holding = self.scanner.needs_more_data();
            let completed_before = self.scanner.completed_count();
            self.scanner.scan(std::slice::from_ref(&byte));

            if self.scanner.needs_more_data() {
                self.held.push(byte);
                continue;
            }
            if !was_holding {
                out.passthrough.push(byte);
                continue;
            }

            // An escape run just ended with this byte.
            self.held.push(byte);
            let frame = std::mem::take(&mut self.held);
            if self.scanner.completed_count() == completed_before {
                // Not an OSC sequence after all (e.g. CSI); pass it on.
                out.passthrough.extend_from_slice(&frame);
                continue;
            }
            match frame_body(&frame) {
                Some(body) if body.starts_with("666666;") => {
                    let reply = self.protocol.handle_sequence(
                        body,
                        &mut self.screen.borrow_mut(),
                        &mut self.resources.borrow_mut(),
                    );
                    if !reply.is_empty() {
                        out.replies.push(reply);
                    }
                }
                // Foreign vendor or undecodable body: untouched.
                _ => out.passthrough.extend_from_slice(&frame),
            }
        }
        out
    }

    /// One main-loop iteration: pump the RPC socket, then run the 3-loop
    /// card protocol for this frame.
    pub fn tick(&mut self, time: f64) -> Result<()> {
        self.server.poll(&mut self.dispatcher);
        self.screen
            .borrow_mut()
            .run_frame(time, &mut self.resources.borrow_mut())
    }

    /// Whether a streaming client asked for an expedited frame since the
    /// last call.
    pub fn take_render_requested(&mut self) -> bool {
        self.resources.borrow_mut().take_render_requested()
    }

    pub fn protocol_mut(&mut self) -> &mut OscCardProtocol {
        &mut self.protocol
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn terminal() -> CardTerminal {
        // Private backing keeps unit tests off the global shm namespace;
        // per-test socket paths keep them off each other's sockets.
        let config = Config::from_yaml("streaming:\n  enabled: false\n").unwrap();
        let dir = tempfile::tempdir().unwrap().into_path();
        CardTerminal::with_socket_path(&config, 80, 24, &dir.join("yetty.sock")).unwrap()
    }

    #[test]
    fn plain_bytes_pass_straight_through() {
        let mut term = terminal();
        let fed = term.feed(b"ls -la\r\n");
        assert_eq!(fed.passthrough, b"ls -la\r\n");
        assert!(fed.replies.is_empty());
    }

    #[test]
    fn card_commands_are_consumed_and_answered() {
        let mut term = terminal();
        let fed = term.feed(b"before\x1b]666666;run -w 80;;\x1b\\after");
        assert_eq!(fed.passthrough, b"beforeafter");
        assert_eq!(fed.replies, vec!["error: run: --card/-c is required\n"]);
    }

    #[test]
    fn successful_run_is_silent_and_hosts_a_card() {
        let mut term = terminal();
        let fed = term.feed(b"\x1b]666666;run -c plot --name audio;--buffer w=4;\x07");
        assert!(fed.passthrough.is_empty());
        assert!(fed.replies.is_empty());
        assert_eq!(term.screen.borrow().cards().len(), 1);
        term.tick(0.0).unwrap();
    }

    #[test]
    fn foreign_osc_passes_through_unmodified() {
        let mut term = terminal();
        let seq = b"\x1b]0;window title\x07";
        let fed = term.feed(seq);
        assert_eq!(fed.passthrough, seq);

        let wrong_vendor = b"\x1b]123456;run -c plot;;\x1b\\";
        let fed = term.feed(wrong_vendor);
        assert_eq!(fed.passthrough, wrong_vendor);
    }

    #[test]
    fn csi_sequences_are_not_swallowed() {
        let mut term = terminal();
        let fed = term.feed(b"\x1b[31mred\x1b[0m");
        assert_eq!(fed.passthrough, b"\x1b[31mred\x1b[0m");
    }

    #[test]
    fn split_chunks_reassemble() {
        let mut term = terminal();
        let seq = b"\x1b]666666;ls;;\x1b\\";
        let mut passthrough = Vec::new();
        let mut replies = Vec::new();
        for chunk in seq.chunks(3) {
            let fed = term.feed(chunk);
            passthrough.extend(fed.passthrough);
            replies.extend(fed.replies);
        }
        assert!(passthrough.is_empty());
        assert_eq!(replies, vec!["no cards\n"]);
    }
}
