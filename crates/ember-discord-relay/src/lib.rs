//! Discord-style relay transport for the ember server.
//!
//! Bridges the in-process chat/command system to an external real-time
//! service: a gateway client holds the persistent websocket session, an API
//! dispatcher serializes all outbound REST calls through one worker, and the
//! relay runtime routes events between the two sides.

pub mod dispatcher;
pub mod gateway;
pub mod markdown;
pub mod outbound;
pub mod relay_runtime;

pub use dispatcher::{ApiDispatcher, RestClient};
pub use gateway::{
    GatewayClient, GatewayError, GatewayEvents, GatewayTransport, SessionState, TransportEvent,
    WebSocketTransport,
};
pub use outbound::{AllowedMentions, OutboundMessage};
pub use relay_runtime::{ConnectRefused, RelayBot};
