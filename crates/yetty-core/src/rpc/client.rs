//! Synchronous RPC client for the terminal's Unix socket.
//!
//! Blocking POSIX connect/send/recv with no event-loop dependency: the shape
//! CLI tools, streaming clients and the integration tests want. Typed
//! convenience wrappers cover the channel-0 vocabulary and the stream
//! methods.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use rmpv::Value;

use crate::error::{Error, Result};
use crate::rpc::{encode_frame, map_field, Channel, MessageType};

/// Blocking msgpack-rpc client.
pub struct RpcClient {
    stream: UnixStream,
    next_msgid: u32,
    read_buf: Vec<u8>,
}

impl RpcClient {
    /// Connect to a server socket.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            Error::Os(std::io::Error::new(
                e.kind(),
                format!("connect {}: {e}", path.display()),
            ))
        })?;
        Ok(Self {
            stream,
            next_msgid: 1,
            read_buf: Vec::new(),
        })
    }

    /// Connect to the socket exported by the hosting terminal
    /// (`$YETTY_SOCKET`).
    pub fn connect_from_env() -> Result<Self> {
        Self::connect(&super::socket_path::socket_path_from_env()?)
    }

    /// Send a request and block for its response's `result` slot.
    pub fn request(&mut self, channel: Channel, method: &str, params: Value) -> Result<Value> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1).max(1);

        let frame = Value::Array(vec![
            Value::from(MessageType::Request as u32),
            Value::from(msgid),
            Value::from(channel as u32),
            Value::from(method),
            params,
        ]);
        self.stream.write_all(&encode_frame(&frame))?;

        loop {
            let value = self.read_frame()?;
            let Some(array) = value.as_array() else {
                return Err(Error::Protocol("response is not an array".into()));
            };
            if array.len() != 4 || array[0].as_u64() != Some(MessageType::Response as u64) {
                return Err(Error::Protocol("malformed response frame".into()));
            }
            if array[1].as_u64() != Some(msgid as u64) {
                // A response to an older in-flight request; skip it.
                continue;
            }
            if !array[2].is_nil() {
                let message = array[2].as_str().unwrap_or("unspecified rpc error");
                return Err(Error::Protocol(message.to_string()));
            }
            return Ok(array[3].clone());
        }
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&mut self, channel: Channel, method: &str, params: Value) -> Result<()> {
        let frame = Value::Array(vec![
            Value::from(MessageType::Notification as u32),
            Value::from(channel as u32),
            Value::from(method),
            params,
        ]);
        self.stream.write_all(&encode_frame(&frame))?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Value> {
        let mut chunk = [0u8; 4096];
        loop {
            if !self.read_buf.is_empty() {
                let mut cursor = std::io::Cursor::new(self.read_buf.as_slice());
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        self.read_buf.drain(..consumed);
                        return Ok(value);
                    }
                    Err(err) if is_incomplete(&err) => {}
                    Err(err) => return Err(Error::Protocol(format!("bad msgpack: {err}"))),
                }
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::Protocol("server closed the connection".into()));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    // =========================================================================
    // Channel 0 convenience wrappers
    // =========================================================================

    pub fn key_down(&mut self, key: i64, mods: i64, scancode: i64) -> Result<bool> {
        self.event_request(
            "key_down",
            vec![
                ("key", Value::from(key)),
                ("mods", Value::from(mods)),
                ("scancode", Value::from(scancode)),
            ],
        )
    }

    pub fn key_up(&mut self, key: i64, mods: i64, scancode: i64) -> Result<bool> {
        self.event_request(
            "key_up",
            vec![
                ("key", Value::from(key)),
                ("mods", Value::from(mods)),
                ("scancode", Value::from(scancode)),
            ],
        )
    }

    pub fn char_input(&mut self, codepoint: u32, mods: i64) -> Result<bool> {
        self.event_request(
            "char",
            vec![
                ("codepoint", Value::from(codepoint)),
                ("mods", Value::from(mods)),
            ],
        )
    }

    pub fn mouse_down(&mut self, x: f64, y: f64, button: i64) -> Result<bool> {
        self.event_request(
            "mouse_down",
            vec![
                ("x", Value::from(x)),
                ("y", Value::from(y)),
                ("button", Value::from(button)),
            ],
        )
    }

    pub fn mouse_move(&mut self, x: f64, y: f64) -> Result<bool> {
        self.event_request("mouse_move", vec![("x", Value::from(x)), ("y", Value::from(y))])
    }

    pub fn set_focus(&mut self, object_id: u64) -> Result<bool> {
        self.event_request("set_focus", vec![("object_id", Value::from(object_id))])
    }

    pub fn close(&mut self, object_id: u64) -> Result<bool> {
        self.event_request("close", vec![("object_id", Value::from(object_id))])
    }

    pub fn split(&mut self, object_id: u64, orientation: i64) -> Result<bool> {
        self.event_request(
            "split",
            vec![
                ("object_id", Value::from(object_id)),
                ("orientation", Value::from(orientation)),
            ],
        )
    }

    /// YAML dump of the workspace tree.
    pub fn ui_tree(&mut self) -> Result<String> {
        let reply = self.request(Channel::EventLoop, "ui_tree", Value::Map(vec![]))?;
        reply
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("ui_tree returned a non-string".into()))
    }

    fn event_request(&mut self, method: &str, fields: Vec<(&str, Value)>) -> Result<bool> {
        let params = Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        );
        let reply = self.request(Channel::EventLoop, method, params)?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    // =========================================================================
    // Channel 1 convenience wrappers
    // =========================================================================

    /// Discover the shared-memory region: `(name, total size)`.
    pub fn stream_connect(&mut self) -> Result<(String, u64)> {
        let reply = self.request(Channel::CardStream, "stream_connect", Value::Map(vec![]))?;
        let name = map_field(&reply, "data_shm")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("stream_connect: missing data_shm".into()))?;
        let size = map_field(&reply, "data_size")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Protocol("stream_connect: missing data_size".into()))?;
        Ok((name.to_string(), size))
    }

    /// Locate a card buffer by registered name: `(header offset, size)`.
    /// `size == 0` means the card has not allocated that scope yet.
    pub fn stream_get_buffer(&mut self, name: &str, scope: &str) -> Result<(u32, u32)> {
        let reply = self.request(
            Channel::CardStream,
            "stream_get_buffer",
            Value::Map(vec![
                (Value::from("name"), Value::from(name)),
                (Value::from("scope"), Value::from(scope)),
            ]),
        )?;
        let offset = map_field(&reply, "offset").and_then(Value::as_u64).unwrap_or(0);
        let size = map_field(&reply, "size").and_then(Value::as_u64).unwrap_or(0);
        Ok((offset as u32, size as u32))
    }

    /// Advisory hint that a buffer was written.
    pub fn stream_mark_dirty(&mut self, name: &str, scope: &str) -> Result<()> {
        self.notify(
            Channel::CardStream,
            "stream_mark_dirty",
            Value::Map(vec![
                (Value::from("name"), Value::from(name)),
                (Value::from("scope"), Value::from(scope)),
            ]),
        )
    }

    pub fn stream_disconnect(&mut self) -> Result<()> {
        self.request(Channel::CardStream, "stream_disconnect", Value::Map(vec![]))?;
        Ok(())
    }

    pub fn buffers_list(&mut self) -> Result<Value> {
        self.request(Channel::CardStream, "buffers_list", Value::Map(vec![]))
    }

    pub fn cards_list(&mut self) -> Result<Value> {
        self.request(Channel::CardStream, "cards_list", Value::Map(vec![]))
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error as DecodeError;
    match err {
        DecodeError::InvalidMarkerRead(io) | DecodeError::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
