//! Contract types shared between the game server and its external relay.
//!
//! The relay consumes chat-bus events and configuration read-only and talks
//! back to the server exclusively through the [`ChatHost`] and
//! [`CommandHost`] traits, so the server side never depends on any transport
//! crate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Permission level of a player or synthetic actor. Higher is more
/// privileged; the host assigns the concrete ladder.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Rank(pub u8);

/// Identity of an external-service user as seen by the relay. Created per
/// inbound event, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUser {
    /// Stable opaque id assigned by the external service.
    pub id: String,
    /// Mutable display name.
    pub nick: String,
    /// Optional decoration prepended when the user is shown in game chat.
    pub prefix: String,
}

impl RelayUser {
    pub fn new(id: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nick: nick.into(),
            prefix: String::new(),
        }
    }

    /// Display name with the prefix decoration applied.
    pub fn display(&self) -> String {
        format!("{}{}", self.prefix, self.nick)
    }
}

/// Who a chat-bus event was addressed to.
#[derive(Clone)]
pub enum ChatScope {
    /// Visible to every player.
    Global,
    /// Visible to players at or above the given rank.
    RankRestricted(Rank),
    /// Addressed to one named player; never relayed externally.
    Direct(String),
}

/// One event published on the in-process chat bus. The relay consumes these
/// read-only.
#[derive(Clone)]
pub struct ChatEvent {
    pub scope: ChatScope,
    /// Name of the originating player, if any (system messages have none).
    pub source: Option<String>,
    /// Rendered text, still carrying internal color codes.
    pub text: String,
    /// Opaque visibility predicate evaluated per recipient rank.
    pub filter: Option<Arc<dyn Fn(Rank) -> bool + Send + Sync>>,
    /// Whether this event should be relayed at all.
    pub relay: bool,
}

impl ChatEvent {
    /// Simulates delivery to a recipient of the given rank.
    pub fn visible_to(&self, rank: Rank) -> bool {
        let scope_ok = match &self.scope {
            ChatScope::Global => true,
            ChatScope::RankRestricted(min) => rank >= *min,
            ChatScope::Direct(_) => false,
        };
        scope_ok && self.filter.as_ref().is_none_or(|filter| filter(rank))
    }
}

impl fmt::Debug for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatEvent")
            .field("source", &self.source)
            .field("text", &self.text)
            .field("relay", &self.relay)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// A player currently online, as reported by the host for who-list queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlinePlayer {
    pub name: String,
    /// Display name of the player's rank group.
    pub group: String,
}

/// Synthetic actor a relayed command runs as. Carries a reply sink routed
/// back to the originating external channel and the configured controller
/// rank.
pub struct CommandActor {
    pub name: String,
    pub rank: Rank,
    reply: Box<dyn FnMut(&str) + Send>,
}

impl CommandActor {
    pub fn new(name: impl Into<String>, rank: Rank, reply: Box<dyn FnMut(&str) + Send>) -> Self {
        Self {
            name: name.into(),
            rank,
            reply,
        }
    }

    /// Delivers a line of command output back to the invoking channel.
    pub fn message(&mut self, text: &str) {
        (self.reply)(text);
    }
}

impl fmt::Debug for CommandActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandActor")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .finish()
    }
}

/// Command system boundary. Execution errors are reported to the invoking
/// channel by the relay; they must never tear anything down.
pub trait CommandHost: Send + Sync {
    fn command_exists(&self, name: &str) -> bool;
    fn execute(&self, name: &str, args: &str, actor: &mut CommandActor) -> anyhow::Result<()>;
}

/// Chat and server-state boundary consumed by the relay.
pub trait ChatHost: Send + Sync {
    /// Injects an external user's message into game chat. `staff_only`
    /// restricts delivery to controller-rank players and above.
    fn inject_chat(&self, user: &RelayUser, text: &str, staff_only: bool);
    fn online_players(&self) -> Vec<OnlinePlayer>;
    fn server_name(&self) -> String;
    fn server_url(&self) -> Option<String>;
}

/// Presence declared to the external service when identifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Online status keyword understood by the service (`online`, `idle`,
    /// `dnd`, `invisible`).
    pub status: String,
    /// Activity text shown next to the bot, if any.
    #[serde(default)]
    pub activity: Option<String>,
}

/// Relay configuration surface. Owned and loaded by the host; the relay
/// consumes it read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub token: String,
    pub gateway_url: String,
    pub api_base: String,
    pub public_channel_ids: Vec<String>,
    pub staff_channel_ids: Vec<String>,
    pub ignored_user_ids: Vec<String>,
    /// External user ids allowed to run relayed commands.
    pub controller_user_ids: Vec<String>,
    /// Command names that may never be run through the relay.
    pub banned_commands: Vec<String>,
    /// First-word token that routes the rest of a channel message to the
    /// command system.
    pub command_trigger: String,
    pub controller_rank: Rank,
    pub default_rank: Rank,
    pub presence: Option<PresenceConfig>,
    pub allow_user_mentions: bool,
    pub allow_role_mentions: bool,
    pub allow_everyone_mentions: bool,
    pub embeds_enabled: bool,
    pub embed_color: u32,
    /// Decoration prepended to external nicks when injected into game chat.
    pub nick_prefix: String,
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            gateway_url: "wss://gateway.discord.gg/?v=10&encoding=json".to_string(),
            api_base: "https://discord.com/api/v10".to_string(),
            public_channel_ids: Vec::new(),
            staff_channel_ids: Vec::new(),
            ignored_user_ids: Vec::new(),
            controller_user_ids: Vec::new(),
            banned_commands: Vec::new(),
            command_trigger: "!".to_string(),
            controller_rank: Rank(100),
            default_rank: Rank(0),
            presence: None,
            allow_user_mentions: true,
            allow_role_mentions: false,
            allow_everyone_mentions: false,
            embeds_enabled: true,
            embed_color: 0x9B_59_B6,
            nick_prefix: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ChatEvent, ChatScope, CommandActor, Rank, RelayConfig, RelayUser};

    fn event(scope: ChatScope) -> ChatEvent {
        ChatEvent {
            scope,
            source: Some("alice".to_string()),
            text: "hello".to_string(),
            filter: None,
            relay: true,
        }
    }

    #[test]
    fn global_scope_is_visible_to_everyone() {
        assert!(event(ChatScope::Global).visible_to(Rank(0)));
        assert!(event(ChatScope::Global).visible_to(Rank(255)));
    }

    #[test]
    fn rank_restricted_scope_requires_minimum_rank() {
        let event = event(ChatScope::RankRestricted(Rank(80)));
        assert!(!event.visible_to(Rank(0)));
        assert!(!event.visible_to(Rank(79)));
        assert!(event.visible_to(Rank(80)));
        assert!(event.visible_to(Rank(100)));
    }

    #[test]
    fn direct_scope_is_never_visible() {
        let event = event(ChatScope::Direct("bob".to_string()));
        assert!(!event.visible_to(Rank(255)));
    }

    #[test]
    fn filter_predicate_narrows_visibility() {
        let mut event = event(ChatScope::Global);
        event.filter = Some(Arc::new(|rank: Rank| rank >= Rank(50)));
        assert!(!event.visible_to(Rank(0)));
        assert!(event.visible_to(Rank(50)));
    }

    #[test]
    fn relay_user_display_applies_prefix() {
        let mut user = RelayUser::new("1234", "alice");
        assert_eq!(user.display(), "alice");
        user.prefix = "(ext) ".to_string();
        assert_eq!(user.display(), "(ext) alice");
    }

    #[test]
    fn command_actor_routes_replies_through_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut actor = CommandActor::new(
            "Relay",
            Rank(100),
            Box::new(move |text| {
                let _ = tx.send(text.to_string());
            }),
        );
        actor.message("done");
        assert_eq!(rx.recv().unwrap(), "done");
    }

    #[test]
    fn config_defaults_are_safe() {
        let config = RelayConfig::default();
        assert!(!config.enabled);
        assert!(config.allow_user_mentions);
        assert!(!config.allow_role_mentions);
        assert!(!config.allow_everyone_mentions);
        assert!(config.controller_user_ids.is_empty());
    }
}
