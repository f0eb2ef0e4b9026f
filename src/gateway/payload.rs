//! Gateway opcode envelope codec.

use bytes::Bytes;
use miniz_oxide::inflate::{self, TINFLStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::config::{ConnectionProperties, Shard};

/// Dispatch type names the core itself interprets.
pub mod dispatch {
    /// fresh handshake completed, carries session id and guild list
    pub const READY: &str = "READY";
    /// resume handshake completed
    pub const RESUMED: &str = "RESUMED";
    /// one member of the startup bulk-state burst
    pub const GUILD_CREATE: &str = "GUILD_CREATE";
    /// answer to a members request, one chunk of a per-guild series
    pub const GUILD_MEMBERS_CHUNK: &str = "GUILD_MEMBERS_CHUNK";
}

/// Error when parse binary data as payload
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ParsePayloadError {
    /// Decompress data failed
    #[snafu(display("decompress payload failed: {status:?}"))]
    DecompressFailed {
        /// data for decode
        data: Bytes,
        /// decompress error status code
        status: TINFLStatus,
    },

    /// data is invalid json
    #[snafu(display("parse json failed: {source:?}"))]
    ParseJSONFailed {
        /// data for decode
        data: Bytes,
        /// source error
        source: serde_json::Error,
    },
}

/// Gateway operation code.
///
/// Unknown numbers are preserved as [`Opcode::Unknown`] so that decoding one
/// payload of a newer protocol revision never breaks the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum Opcode {
    /// Event dispatch, server -> client
    Dispatch,
    /// Heartbeat, both directions (server side means "beat now")
    Heartbeat,
    /// Identify handshake, client -> server
    Identify,
    /// Resume handshake, client -> server
    Resume,
    /// Drop and resume request, server -> client
    Reconnect,
    /// Bulk member request, client -> server
    RequestGuildMembers,
    /// Session invalidated, server -> client, data is a resumable flag
    InvalidSession,
    /// First message of a connection, server -> client
    Hello,
    /// Heartbeat acknowledgement, server -> client
    HeartbeatAck,
    /// Any number this client does not understand
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::Unknown(other) => other,
        }
    }
}

/// Gateway payload envelope: `{op, d, s, t}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// operation code, selects handling
    pub op: Opcode,
    /// opcode-specific data
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub d: Value,
    /// sequence number, only present on dispatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// dispatch type name, only present on dispatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Payload {
    /// Decode raw frame data to a payload, inflating first when `compressed`.
    pub fn decode(mut buff: Bytes, compressed: bool) -> Result<Self, ParsePayloadError> {
        if compressed {
            buff = inflate::decompress_to_vec_zlib(&buff)
                .map_err(|status| ParsePayloadError::DecompressFailed {
                    data: buff.clone(),
                    status,
                })?
                .into();
        }

        serde_json::from_slice(&buff).context(error::ParseJSONFailed { data: buff.clone() })
    }

    /// Encode the payload to frame text.
    pub fn encode(&self) -> String {
        // Payload is a plain json object, serializing it cannot fail
        serde_json::to_string(self).unwrap()
    }

    /// Parse the `d` field as a typed structure.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.d.clone())
    }

    /// Dispatch type name, empty when this payload is not a dispatch.
    pub fn kind(&self) -> &str {
        self.t.as_deref().unwrap_or_default()
    }

    fn control(op: Opcode, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    /// Build an identify handshake payload.
    pub fn identify(
        token: &str,
        properties: &ConnectionProperties,
        shard: Option<Shard>,
        compress: bool,
    ) -> Self {
        let mut d = json!({
            "token": token,
            "properties": properties,
            "compress": compress,
        });

        if let Some(shard) = shard {
            // serializing a plain object above cannot produce a non-object
            d.as_object_mut()
                .unwrap()
                .insert("shard".to_string(), json!([shard.id, shard.count]));
        }

        Self::control(Opcode::Identify, d)
    }

    /// Build a resume handshake payload.
    pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> Self {
        Self::control(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": seq,
            }),
        )
    }

    /// Build a heartbeat payload carrying the last seen sequence number.
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self::control(Opcode::Heartbeat, seq.map(Value::from).unwrap_or(Value::Null))
    }

    /// Build a bulk member request for a batch of guild ids.
    pub fn request_guild_members<S: AsRef<str>>(guild_ids: &[S]) -> Self {
        let ids: Vec<&str> = guild_ids.iter().map(AsRef::as_ref).collect();
        Self::control(
            Opcode::RequestGuildMembers,
            json!({
                "guild_id": ids,
                "query": "",
                "limit": 0,
            }),
        )
    }
}

/// Hello payload data
#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    /// heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
    /// connected gateway server names
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}

/// READY dispatch data
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    /// session id for later resumes
    pub session_id: String,
    /// connected gateway server names
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
    /// guilds the session has access to, streamed in afterwards
    #[serde(default)]
    pub guilds: Vec<GuildStub>,
}

/// Guild reference inside a READY dispatch
#[derive(Debug, Clone, Deserialize)]
pub struct GuildStub {
    /// guild id
    pub id: String,
}

/// GUILD_MEMBERS_CHUNK dispatch data
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMembersChunkData {
    /// guild this chunk belongs to
    pub guild_id: String,
    /// index of this chunk in the series
    #[serde(default)]
    pub chunk_index: u64,
    /// total chunks of the series
    #[serde(default = "chunk_count_default")]
    pub chunk_count: u64,
}

fn chunk_count_default() -> u64 {
    1
}

#[cfg(test)]
mod test {
    mod decode {
        use super::super::*;

        #[test]
        fn test_payload_decode_hello() {
            let data = serde_json::to_vec(&json!({
                "op": 10,
                "d": {
                    "heartbeat_interval": 41250,
                    "_trace": ["gateway-prd-main-0001"],
                },
            }))
            .unwrap()
            .into();

            let payload = Payload::decode(data, false).unwrap();

            assert_eq!(payload.op, Opcode::Hello);

            let hello: HelloData = payload.parse_data().unwrap();
            assert_eq!(hello.heartbeat_interval, 41250);
            assert_eq!(hello.trace, vec!["gateway-prd-main-0001"]);
        }

        #[test]
        fn test_payload_decode_dispatch() {
            let data = serde_json::to_vec(&json!({
                "op": 0,
                "s": 42,
                "t": "MESSAGE_CREATE",
                "d": { "content": "hi" },
            }))
            .unwrap()
            .into();

            let payload = Payload::decode(data, false).unwrap();

            assert_eq!(payload.op, Opcode::Dispatch);
            assert_eq!(payload.s, Some(42));
            assert_eq!(payload.kind(), "MESSAGE_CREATE");
        }

        #[test]
        fn test_payload_decode_invalid_session() {
            let data = serde_json::to_vec(&json!({
                "op": 9,
                "d": true,
            }))
            .unwrap()
            .into();

            let payload = Payload::decode(data, false).unwrap();

            assert_eq!(payload.op, Opcode::InvalidSession);
            assert_eq!(payload.d.as_bool(), Some(true));
        }

        #[test]
        fn test_payload_decode_unknown_opcode() {
            let data = serde_json::to_vec(&json!({
                "op": 200,
                "d": {},
            }))
            .unwrap()
            .into();

            let payload = Payload::decode(data, false).unwrap();

            assert_eq!(payload.op, Opcode::Unknown(200));
        }

        #[test]
        fn test_payload_decode_compressed() {
            let raw = serde_json::to_vec(&json!({
                "op": 11,
            }))
            .unwrap();

            let data = miniz_oxide::deflate::compress_to_vec_zlib(&raw, 6).into();

            let payload = Payload::decode(data, true).unwrap();

            assert_eq!(payload.op, Opcode::HeartbeatAck);
        }

        #[test]
        fn test_payload_decode_garbage_is_error() {
            let data = Bytes::from_static(b"not json at all");

            assert!(matches!(
                Payload::decode(data, false),
                Err(ParsePayloadError::ParseJSONFailed { .. })
            ));
        }

        #[test]
        fn test_payload_decode_ready() {
            let data = serde_json::to_vec(&json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {
                    "session_id": "abc",
                    "_trace": ["gateway-prd-main-0001"],
                    "guilds": [{"id": "1", "unavailable": true}, {"id": "2", "unavailable": true}],
                },
            }))
            .unwrap()
            .into();

            let payload = Payload::decode(data, false).unwrap();
            let ready: ReadyData = payload.parse_data().unwrap();

            assert_eq!(ready.session_id, "abc");
            assert_eq!(ready.guilds.len(), 2);
            assert_eq!(ready.guilds[0].id, "1");
        }
    }

    mod encode {
        use super::super::*;

        #[test]
        fn test_payload_encode_heartbeat() {
            let encoded = Payload::heartbeat(Some(7)).encode();
            let value: Value = serde_json::from_str(&encoded).unwrap();

            assert_eq!(value["op"], 1);
            assert_eq!(value["d"], 7);
        }

        #[test]
        fn test_payload_encode_heartbeat_without_seq() {
            let encoded = Payload::heartbeat(None).encode();
            let value: Value = serde_json::from_str(&encoded).unwrap();

            assert_eq!(value["op"], 1);
            assert!(value["d"].is_null());
        }

        #[test]
        fn test_payload_encode_identify_with_shard() {
            let payload = Payload::identify(
                "tok",
                &ConnectionProperties::default(),
                Some(Shard { id: 1, count: 4 }),
                false,
            );
            let value: Value = serde_json::from_str(&payload.encode()).unwrap();

            assert_eq!(value["op"], 2);
            assert_eq!(value["d"]["token"], "tok");
            assert_eq!(value["d"]["shard"], json!([1, 4]));
            assert!(value.get("s").is_none());
        }

        #[test]
        fn test_payload_encode_resume() {
            let payload = Payload::resume("tok", "abc", Some(100));
            let value: Value = serde_json::from_str(&payload.encode()).unwrap();

            assert_eq!(value["op"], 6);
            assert_eq!(value["d"]["session_id"], "abc");
            assert_eq!(value["d"]["seq"], 100);
        }

        #[test]
        fn test_payload_encode_member_request() {
            let payload = Payload::request_guild_members(&["1", "2", "3"]);
            let value: Value = serde_json::from_str(&payload.encode()).unwrap();

            assert_eq!(value["op"], 8);
            assert_eq!(value["d"]["guild_id"], json!(["1", "2", "3"]));
            assert_eq!(value["d"]["limit"], 0);
        }
    }
}
