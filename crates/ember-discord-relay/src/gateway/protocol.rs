//! Wire protocol for the gateway: JSON frames with an integer `op` code and
//! a `d` payload; dispatch frames additionally carry `t` and `s`.

use ember_relay_contract::PresenceConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const RESUME: u8 = 6;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
}

pub mod close_code {
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

/// Event-category subscription bits declared at identify time.
pub mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const DIRECT_MESSAGES: u64 = 1 << 12;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;

    pub const DEFAULT: u64 = GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub user: ReadyUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: String,
}

/// Decoded `MESSAGE_CREATE` payload, reduced to the fields the relay routes
/// on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author: MessageAuthor,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

/// Decoded `CHANNEL_CREATE` payload; only used to learn the channel kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedChannel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

impl CreatedChannel {
    pub fn is_direct(&self) -> bool {
        self.kind == 1
    }
}

pub fn build_heartbeat(sequence: Option<u64>) -> GatewayFrame {
    GatewayFrame {
        op: opcode::HEARTBEAT,
        d: Some(sequence.map_or(Value::Null, Value::from)),
        s: None,
        t: None,
    }
}

pub fn build_identify(token: &str, intents: u64, presence: Option<&PresenceConfig>) -> GatewayFrame {
    let mut d = json!({
        "token": token,
        "intents": intents,
        "properties": {
            "os": std::env::consts::OS,
            "browser": "ember-relay",
            "device": "ember-relay",
        },
    });
    if let Some(presence) = presence {
        let activities = match &presence.activity {
            Some(name) => json!([{ "name": name, "type": 0 }]),
            None => json!([]),
        };
        d["presence"] = json!({
            "status": presence.status,
            "activities": activities,
            "since": Value::Null,
            "afk": false,
        });
    }
    GatewayFrame {
        op: opcode::IDENTIFY,
        d: Some(d),
        s: None,
        t: None,
    }
}

pub fn build_resume(token: &str, session_id: &str, sequence: u64) -> GatewayFrame {
    GatewayFrame {
        op: opcode::RESUME,
        d: Some(json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_carries_sequence_or_null() {
        let with_seq = build_heartbeat(Some(42));
        assert_eq!(with_seq.op, opcode::HEARTBEAT);
        assert_eq!(with_seq.d, Some(Value::from(42)));

        let without = build_heartbeat(None);
        assert_eq!(without.d, Some(Value::Null));
    }

    #[test]
    fn identify_declares_token_intents_and_presence() {
        let presence = PresenceConfig {
            status: "online".to_string(),
            activity: Some("ember".to_string()),
        };
        let frame = build_identify("tok", intents::DEFAULT, Some(&presence));
        assert_eq!(frame.op, opcode::IDENTIFY);
        let d = frame.d.unwrap();
        assert_eq!(d["token"], "tok");
        assert_eq!(d["intents"], intents::DEFAULT);
        assert_eq!(d["presence"]["status"], "online");
        assert_eq!(d["presence"]["activities"][0]["name"], "ember");
    }

    #[test]
    fn resume_carries_exact_session_values() {
        let frame = build_resume("tok", "sess-9", 512);
        assert_eq!(frame.op, opcode::RESUME);
        let d = frame.d.unwrap();
        assert_eq!(d["session_id"], "sess-9");
        assert_eq!(d["seq"], 512);
    }

    #[test]
    fn dispatch_frame_round_trips_through_json() {
        let raw = r#"{"op":0,"d":{"content":"hi"},"s":7,"t":"MESSAGE_CREATE"}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.op, opcode::DISPATCH);
        assert_eq!(frame.s, Some(7));
        assert_eq!(frame.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250,"_trace":["x"]}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        let hello: HelloPayload = serde_json::from_value(frame.d.unwrap()).unwrap();
        assert_eq!(hello.heartbeat_interval, 41_250);
    }
}
