//! Out-of-band RPC: msgpack-rpc over a per-terminal Unix domain socket.
//!
//! Wire format is msgpack-rpc with a channel extension tagging the handling
//! subsystem:
//!
//! ```text
//! Request:      [0, msgid, channel, method, params]
//! Response:     [1, msgid, error, result]      (exactly one of error/result non-nil)
//! Notification: [2, channel, method, params]
//! ```

pub mod client;
pub mod dispatcher;
pub mod server;
pub mod socket_path;

pub use client::RpcClient;
pub use dispatcher::CardSystemDispatcher;
pub use server::{RpcDispatch, RpcServer};
pub use socket_path::{socket_path_for_pid, SOCKET_ENV_VAR};

use rmpv::Value;

use crate::error::{Error, Result};

/// Channel ids multiplexing RPC messages across subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Input events, tree queries, tree mutations.
    EventLoop = 0,
    /// Shared-memory discovery, buffer location, mark-dirty.
    CardStream = 1,
}

impl Channel {
    pub fn from_wire(value: u32) -> Option<Channel> {
        match value {
            0 => Some(Channel::EventLoop),
            1 => Some(Channel::CardStream),
            _ => None,
        }
    }
}

/// Message types following the msgpack-rpc spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Notification = 2,
}

/// A single decoded RPC message.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    pub msg_type: MessageType,
    /// 0 for notifications.
    pub msgid: u32,
    pub channel: u32,
    pub method: String,
    pub params: Value,
}

/// Decode one wire value into a request or notification.
pub fn decode_message(value: Value) -> Result<RpcMessage> {
    let Value::Array(mut array) = value else {
        return Err(Error::Protocol("expected array frame".into()));
    };
    if array.len() < 3 {
        return Err(Error::Protocol(format!(
            "frame too short: {} elements",
            array.len()
        )));
    }
    let msg_type = array[0]
        .as_u64()
        .ok_or_else(|| Error::Protocol("non-integer message type".into()))?;

    match msg_type {
        0 => {
            // [0, msgid, channel, method, params]
            if array.len() < 5 {
                return Err(Error::Protocol("request frame too short".into()));
            }
            let params = array.remove(4);
            let method = take_str(&array[3])?;
            Ok(RpcMessage {
                msg_type: MessageType::Request,
                msgid: take_u32(&array[1])?,
                channel: take_u32(&array[2])?,
                method,
                params,
            })
        }
        2 => {
            // [2, channel, method, params]
            if array.len() < 4 {
                return Err(Error::Protocol("notification frame too short".into()));
            }
            let params = array.remove(3);
            let method = take_str(&array[2])?;
            Ok(RpcMessage {
                msg_type: MessageType::Notification,
                msgid: 0,
                channel: take_u32(&array[1])?,
                method,
                params,
            })
        }
        other => Err(Error::Protocol(format!("unknown message type {other}"))),
    }
}

/// Encode a success response: `[1, msgid, nil, result]`.
pub fn encode_result(msgid: u32, result: &Value) -> Vec<u8> {
    encode_frame(&Value::Array(vec![
        Value::from(MessageType::Response as u32),
        Value::from(msgid),
        Value::Nil,
        result.clone(),
    ]))
}

/// Encode an error response: `[1, msgid, error, nil]`.
pub fn encode_error(msgid: u32, error: &str) -> Vec<u8> {
    encode_frame(&Value::Array(vec![
        Value::from(MessageType::Response as u32),
        Value::from(msgid),
        Value::from(error),
        Value::Nil,
    ]))
}

pub(crate) fn encode_frame(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = rmpv::encode::write_value(&mut buf, value);
    buf
}

fn take_u32(value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::Protocol(format!("expected u32, got {value}")))
}

fn take_str(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("expected string, got {value}")))
}

// =============================================================================
// Param-map access helpers (params are maps of named fields)
// =============================================================================

pub(crate) fn map_field<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    params.as_map()?.iter().find_map(|(k, v)| {
        (k.as_str() == Some(key)).then_some(v)
    })
}

pub(crate) fn field_i64(params: &Value, key: &str) -> std::result::Result<i64, String> {
    map_field(params, key)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("missing or non-integer field: {key}"))
}

pub(crate) fn field_u64(params: &Value, key: &str) -> std::result::Result<u64, String> {
    map_field(params, key)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing or non-integer field: {key}"))
}

pub(crate) fn field_f64(params: &Value, key: &str) -> std::result::Result<f64, String> {
    map_field(params, key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing or non-numeric field: {key}"))
}

pub(crate) fn field_str<'a>(
    params: &'a Value,
    key: &str,
) -> std::result::Result<&'a str, String> {
    map_field(params, key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing or non-string field: {key}"))
}
