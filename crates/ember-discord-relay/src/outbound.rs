//! Outbound message model: the closed set of message variants the relay can
//! send, each knowing its REST route and wire body, plus the merge rule the
//! dispatcher uses to reduce call volume.

use ember_relay_contract::RelayConfig;
use serde_json::{json, Value};

/// Upper bound on a merged text buffer. Two messages whose combined length
/// would exceed this travel as separate calls.
pub const MAX_MERGED_CHARS: usize = 1024;

/// Which categories of @mention a text message may trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedMentions {
    pub users: bool,
    pub roles: bool,
    pub everyone: bool,
}

impl Default for AllowedMentions {
    fn default() -> Self {
        Self {
            users: true,
            roles: false,
            everyone: false,
        }
    }
}

impl AllowedMentions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            users: config.allow_user_mentions,
            roles: config.allow_role_mentions,
            everyone: config.allow_everyone_mentions,
        }
    }

    fn parse_list(&self) -> Vec<&'static str> {
        let mut parse = Vec::new();
        if self.users {
            parse.push("users");
        }
        if self.roles {
            parse.push("roles");
        }
        if self.everyone {
            parse.push("everyone");
        }
        parse
    }
}

/// One queued outbound call. Created by the orchestrator, consumed exactly
/// once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text {
        channel_id: String,
        content: String,
        allowed_mentions: AllowedMentions,
    },
    /// Structured send; always suppresses all mentions.
    Embed {
        channel_id: String,
        title: String,
        fields: Vec<(String, String)>,
        color: u32,
    },
}

impl OutboundMessage {
    pub fn text(
        channel_id: impl Into<String>,
        content: impl Into<String>,
        allowed_mentions: AllowedMentions,
    ) -> Self {
        Self::Text {
            channel_id: channel_id.into(),
            content: content.into(),
            allowed_mentions,
        }
    }

    pub fn embed(
        channel_id: impl Into<String>,
        title: impl Into<String>,
        fields: Vec<(String, String)>,
        color: u32,
    ) -> Self {
        Self::Embed {
            channel_id: channel_id.into(),
            title: title.into(),
            fields,
            color,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Self::Text { channel_id, .. } | Self::Embed { channel_id, .. } => channel_id,
        }
    }

    /// REST route this message is delivered to.
    pub fn route(&self) -> String {
        format!("/channels/{}/messages", self.channel_id())
    }

    /// JSON wire body.
    pub fn body(&self) -> Value {
        match self {
            Self::Text {
                content,
                allowed_mentions,
                ..
            } => json!({
                "content": content,
                "allowed_mentions": { "parse": allowed_mentions.parse_list() },
            }),
            Self::Embed {
                title,
                fields,
                color,
                ..
            } => {
                let fields: Vec<Value> = fields
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": value, "inline": true }))
                    .collect();
                json!({
                    "embeds": [{ "title": title, "color": color, "fields": fields }],
                    "allowed_mentions": { "parse": [] },
                })
            }
        }
    }

    /// Attempts to merge `other` into this message. Only same-route,
    /// same-variant text messages merge; the buffers are joined with a
    /// newline, bounded by [`MAX_MERGED_CHARS`]. Returns the refused message
    /// when the two must travel separately.
    pub fn try_absorb(&mut self, other: OutboundMessage) -> Option<OutboundMessage> {
        let mergeable = match (&*self, &other) {
            (
                Self::Text {
                    channel_id,
                    content,
                    ..
                },
                Self::Text {
                    channel_id: other_channel,
                    content: other_content,
                    ..
                },
            ) => {
                channel_id == other_channel
                    && content.chars().count() + 1 + other_content.chars().count()
                        <= MAX_MERGED_CHARS
            }
            _ => false,
        };
        if !mergeable {
            return Some(other);
        }
        if let (Self::Text { content, .. }, Self::Text { content: extra, .. }) = (self, other) {
            content.push('\n');
            content.push_str(&extra);
        }
        None
    }
}
