//! Unix-domain-socket RPC server.
//!
//! Single-threaded and cooperative: the terminal's main loop calls
//! [`poll`](RpcServer::poll) once per iteration, which accepts pending
//! connections, drains readable clients, runs each complete message through
//! the dispatcher to completion, and flushes write queues. Everything is
//! non-blocking; a handler must never block on external I/O.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use rmpv::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::{decode_message, encode_error, encode_result, MessageType, RpcMessage};

/// Per-client write queue cap; a client that falls this far behind is
/// disconnected rather than ballooning the terminal's memory.
const MAX_WRITE_QUEUE: usize = 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Message sink: routes one decoded request/notification to its subsystem.
/// Errors become the `error` slot of the response tuple.
pub trait RpcDispatch {
    fn handle(&mut self, msg: &RpcMessage) -> std::result::Result<Value, String>;
}

struct Connection {
    stream: UnixStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    open: bool,
}

impl Connection {
    fn queue(&mut self, bytes: Vec<u8>) {
        if self.write_buf.len() + bytes.len() > MAX_WRITE_QUEUE {
            warn!("rpc client write queue overflow, disconnecting");
            self.open = false;
            return;
        }
        self.write_buf.extend_from_slice(&bytes);
    }
}

/// The per-terminal RPC endpoint.
pub struct RpcServer {
    listener: UnixListener,
    path: PathBuf,
    clients: Vec<Connection>,
}

impl RpcServer {
    /// Bind the socket (replacing a stale file) and start listening.
    /// Failure to bind is fatal to the terminal; the caller exits.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            Error::Os(std::io::Error::new(
                e.kind(),
                format!("bind {}: {e}", path.display()),
            ))
        })?;
        listener.set_nonblocking(true)?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;

        info!(path = %path.display(), "rpc server listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            clients: Vec::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// One cooperative iteration: accept, read, dispatch, write.
    pub fn poll(&mut self, dispatch: &mut dyn RpcDispatch) {
        self.accept_pending();
        for i in 0..self.clients.len() {
            self.read_client(i, dispatch);
        }
        self.flush_writes();
        self.clients.retain(|c| c.open);
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!(%err, "failed to set client non-blocking");
                        continue;
                    }
                    self.clients.push(Connection {
                        stream,
                        read_buf: Vec::with_capacity(READ_CHUNK),
                        write_buf: Vec::new(),
                        open: true,
                    });
                    info!(total = self.clients.len(), "rpc client connected");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(%err, "rpc accept error");
                    return;
                }
            }
        }
    }

    fn read_client(&mut self, index: usize, dispatch: &mut dyn RpcDispatch) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let client = &mut self.clients[index];
            match client.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("rpc client disconnected");
                    client.open = false;
                    break;
                }
                Ok(n) => client.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "rpc read error");
                    client.open = false;
                    break;
                }
            }
        }
        self.drain_messages(index, dispatch);
    }

    /// Decode and dispatch every complete message buffered for one client.
    fn drain_messages(&mut self, index: usize, dispatch: &mut dyn RpcDispatch) {
        loop {
            let client = &mut self.clients[index];
            if client.read_buf.is_empty() {
                return;
            }
            let mut cursor = std::io::Cursor::new(client.read_buf.as_slice());
            let value = match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => value,
                Err(err) => {
                    if is_incomplete(&err) {
                        return; // partial frame, wait for more bytes
                    }
                    warn!(%err, "undecodable msgpack, dropping client");
                    client.open = false;
                    return;
                }
            };
            let consumed = cursor.position() as usize;
            client.read_buf.drain(..consumed);

            match decode_message(value) {
                Ok(msg) => self.dispatch_message(index, &msg, dispatch),
                Err(err) => {
                    // Well-formed msgpack but not a valid frame; skip it.
                    warn!(%err, "malformed rpc frame");
                }
            }
        }
    }

    fn dispatch_message(
        &mut self,
        index: usize,
        msg: &RpcMessage,
        dispatch: &mut dyn RpcDispatch,
    ) {
        debug!(
            msgid = msg.msgid,
            channel = msg.channel,
            method = %msg.method,
            "rpc message"
        );
        match msg.msg_type {
            MessageType::Request => {
                let reply = match dispatch.handle(msg) {
                    Ok(result) => encode_result(msg.msgid, &result),
                    Err(error) => encode_error(msg.msgid, &error),
                };
                self.clients[index].queue(reply);
            }
            MessageType::Notification => {
                if let Err(error) = dispatch.handle(msg) {
                    // Fire-and-forget: a log line and a no-op.
                    warn!(method = %msg.method, %error, "rpc notification failed");
                }
            }
            MessageType::Response => {
                warn!("unexpected response frame from client");
            }
        }
    }

    fn flush_writes(&mut self) {
        for client in &mut self.clients {
            while !client.write_buf.is_empty() {
                match client.stream.write(&client.write_buf) {
                    Ok(0) => {
                        client.open = false;
                        break;
                    }
                    Ok(n) => {
                        client.write_buf.drain(..n);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(%err, "rpc write error");
                        client.open = false;
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error as DecodeError;
    match err {
        DecodeError::InvalidMarkerRead(io) | DecodeError::InvalidDataRead(io) => {
            io.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::encode_frame;

    /// Echo dispatcher: returns the method name, errors on "boom".
    struct Echo;

    impl RpcDispatch for Echo {
        fn handle(&mut self, msg: &RpcMessage) -> std::result::Result<Value, String> {
            if msg.method == "boom" {
                Err("kaboom".to_string())
            } else {
                Ok(Value::from(msg.method.as_str()))
            }
        }
    }

    fn request(msgid: u32, method: &str) -> Vec<u8> {
        encode_frame(&Value::Array(vec![
            Value::from(0u32),
            Value::from(msgid),
            Value::from(0u32),
            Value::from(method),
            Value::Map(vec![]),
        ]))
    }

    fn read_response(stream: &mut UnixStream, server: &mut RpcServer, echo: &mut Echo) -> Value {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        for _ in 0..100 {
            server.poll(echo);
            match stream.read(&mut chunk) {
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Ok(value) = rmpv::decode::read_value(&mut &buf[..]) {
                        return value;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
        panic!("no response after polling");
    }

    fn bound_server() -> (RpcServer, PathBuf) {
        let dir = tempfile::tempdir().unwrap().into_path();
        let path = dir.join("server.sock");
        (RpcServer::bind(&path).unwrap(), path)
    }

    #[test]
    fn request_gets_result_response() {
        let (mut server, path) = bound_server();
        let mut echo = Echo;

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream.write_all(&request(7, "ping")).unwrap();

        let value = read_response(&mut stream, &mut server, &mut echo);
        let array = value.as_array().unwrap();
        assert_eq!(array[1].as_u64(), Some(7));
        assert!(array[2].is_nil());
        assert_eq!(array[3].as_str(), Some("ping"));
    }

    #[test]
    fn handler_error_fills_error_slot() {
        let (mut server, path) = bound_server();
        let mut echo = Echo;

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream.write_all(&request(9, "boom")).unwrap();

        let value = read_response(&mut stream, &mut server, &mut echo);
        let array = value.as_array().unwrap();
        assert_eq!(array[2].as_str(), Some("kaboom"));
        assert!(array[3].is_nil());
    }

    #[test]
    fn partial_frames_are_buffered_until_complete() {
        let (mut server, path) = bound_server();
        let mut echo = Echo;

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();
        let frame = request(3, "split_me");
        let (head, tail) = frame.split_at(frame.len() / 2);

        stream.write_all(head).unwrap();
        server.poll(&mut echo);
        server.poll(&mut echo);
        stream.write_all(tail).unwrap();

        let value = read_response(&mut stream, &mut server, &mut echo);
        assert_eq!(value.as_array().unwrap()[3].as_str(), Some("split_me"));
    }

    #[test]
    fn requests_answered_in_arrival_order() {
        let (mut server, path) = bound_server();
        let mut echo = Echo;

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();
        let mut bytes = request(1, "first");
        bytes.extend(request(2, "second"));
        stream.write_all(&bytes).unwrap();

        let first = read_response(&mut stream, &mut server, &mut echo);
        assert_eq!(first.as_array().unwrap()[1].as_u64(), Some(1));
    }

    #[test]
    fn disconnect_drops_the_client() {
        let (mut server, path) = bound_server();
        let mut echo = Echo;

        let stream = UnixStream::connect(&path).unwrap();
        server.poll(&mut echo);
        assert_eq!(server.client_count(), 1);

        drop(stream);
        // EOF surfaces on the next poll.
        std::thread::sleep(std::time::Duration::from_millis(5));
        server.poll(&mut echo);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn socket_file_mode_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (server, path) = bound_server();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        drop(server);
        assert!(!path.exists());
    }
}
