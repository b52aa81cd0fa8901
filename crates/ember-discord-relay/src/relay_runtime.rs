//! Relay bot orchestrator: generic connect/disconnect/reset lifecycle, the
//! bounded-retry reconnect loop, and routing between the in-process chat
//! bus / command system and the external service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ember_relay_contract::{
    ChatEvent, ChatHost, CommandActor, CommandHost, RelayConfig, RelayUser,
};

use crate::dispatcher::{ApiDispatcher, RestClient};
use crate::gateway::protocol::{intents, CreatedChannel, InboundMessage};
use crate::gateway::{GatewayClient, GatewayError, GatewayEvents, WebSocketTransport};
use crate::markdown;
use crate::outbound::{AllowedMentions, OutboundMessage};

const MAX_CONNECT_RETRIES: u32 = 3;
/// Pause after a dropped connection before trying again; drops are assumed
/// to be network blips and do not consume a retry slot.
const CONNECTION_DROP_DELAY: Duration = Duration::from_secs(30);
const BUILTIN_COOLDOWN: Duration = Duration::from_secs(5);
const UNAUTHORIZED_NOTICE_COOLDOWN: Duration = Duration::from_secs(60);

/// Why `connect` declined to start a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectRefused {
    #[error("relay is disabled in configuration")]
    Disabled,
    #[error("relay is already connected")]
    AlreadyConnected,
    #[error("host is shutting down")]
    ShuttingDown,
}

struct ConnectionHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one gateway connection and one API dispatcher, bridging them to the
/// collaborator chat bus and command system.
pub struct RelayBot {
    config: Arc<RelayConfig>,
    commands: Arc<dyn CommandHost>,
    chat: Arc<dyn ChatHost>,
    dispatcher: ApiDispatcher,
    dispatcher_handle: JoinHandle<()>,
    connection: Option<ConnectionHandle>,
    can_reconnect: Arc<AtomicBool>,
    shutting_down: bool,
}

impl RelayBot {
    pub fn new(
        config: RelayConfig,
        commands: Arc<dyn CommandHost>,
        chat: Arc<dyn ChatHost>,
    ) -> anyhow::Result<Self> {
        let rest =
            RestClient::new(&config.api_base, &config.token, config.request_timeout_ms)?;
        let (dispatcher, dispatcher_handle) = ApiDispatcher::spawn(rest);
        Ok(Self {
            config: Arc::new(config),
            commands,
            chat,
            dispatcher,
            dispatcher_handle,
            connection: None,
            can_reconnect: Arc::new(AtomicBool::new(true)),
            shutting_down: false,
        })
    }

    /// Whether a connection task currently exists.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Starts the connection task. A refusal reason is returned when the
    /// relay is disabled, already connected, or the host is shutting down.
    pub fn connect(&mut self) -> Result<(), ConnectRefused> {
        if !self.config.enabled {
            return Err(ConnectRefused::Disabled);
        }
        if self.shutting_down {
            return Err(ConnectRefused::ShuttingDown);
        }
        if self.connection.is_some() {
            return Err(ConnectRefused::AlreadyConnected);
        }

        self.can_reconnect.store(true, Ordering::SeqCst);
        let retries = Arc::new(AtomicU32::new(0));
        let router = EventRouter::new(
            self.config.clone(),
            self.dispatcher.clone(),
            self.commands.clone(),
            self.chat.clone(),
            retries.clone(),
        );
        let gateway = GatewayClient::new(
            self.config.token.clone(),
            self.config.gateway_url.clone(),
            intents::DEFAULT,
            self.config.presence.clone(),
            Box::new(WebSocketTransport::new()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let can_reconnect = self.can_reconnect.clone();
        let handle = tokio::spawn(run_connection_loop(
            gateway,
            router,
            retries,
            can_reconnect,
            shutdown_rx,
        ));
        self.connection = Some(ConnectionHandle {
            shutdown_tx,
            handle,
        });
        info!("relay connection started");
        Ok(())
    }

    /// Requests the transport to close and joins the connection task.
    /// Idempotent; safe to call when not connected.
    pub async fn disconnect(&mut self, reason: &str) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let _ = connection.shutdown_tx.send(true);
        if let Err(error) = connection.handle.await {
            warn!(%error, "relay connection task join failed");
        }
        info!(reason, "relay disconnected");
    }

    pub async fn reset(&mut self) -> Result<(), ConnectRefused> {
        self.disconnect("reset requested").await;
        self.connect()
    }

    /// Marks the host as shutting down so further `connect` calls refuse.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    /// Disconnects and stops the dispatcher, dropping any still-queued
    /// messages that have not been sent yet.
    pub async fn shutdown(mut self) {
        self.shutting_down = true;
        self.disconnect("host shutting down").await;
        drop(self.dispatcher);
        if let Err(error) = self.dispatcher_handle.await {
            warn!(%error, "dispatcher task join failed");
        }
    }

    /// Fans a chat-bus event out to the public and staff destination pools
    /// by simulating the visibility filter at each pool's rank. Callable
    /// from any task; only enqueues.
    pub fn relay_chat_event(&self, event: &ChatEvent) {
        for (channel, chunk) in chat_event_destinations(event, &self.config) {
            self.dispatcher.enqueue(OutboundMessage::text(
                channel,
                chunk,
                AllowedMentions::from_config(&self.config),
            ));
        }
    }
}

/// Destination channel / chunk pairs for one chat-bus event. A message may
/// go to both pools, either, or neither.
fn chat_event_destinations(event: &ChatEvent, config: &RelayConfig) -> Vec<(String, String)> {
    if !event.relay {
        return Vec::new();
    }
    let text = markdown::sanitize_outbound(&event.text);
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chunks = markdown::chunk_message(&text, markdown::MAX_MESSAGE_CHARS);

    let mut destinations = Vec::new();
    if event.visible_to(config.default_rank) {
        for channel in &config.public_channel_ids {
            for chunk in &chunks {
                destinations.push((channel.clone(), chunk.clone()));
            }
        }
    }
    if event.visible_to(config.controller_rank) {
        for channel in &config.staff_channel_ids {
            for chunk in &chunks {
                destinations.push((channel.clone(), chunk.clone()));
            }
        }
    }
    destinations
}

/// Connection task body. Runs sessions until reconnection is no longer
/// permitted or the bounded retries are exhausted.
async fn run_connection_loop(
    mut gateway: GatewayClient,
    mut router: EventRouter,
    retries: Arc<AtomicU32>,
    can_reconnect: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if !can_reconnect.load(Ordering::SeqCst)
            || retries.load(Ordering::SeqCst) >= MAX_CONNECT_RETRIES
            || *shutdown_rx.borrow()
        {
            break;
        }
        retries.fetch_add(1, Ordering::SeqCst);

        match gateway.run_session(&mut router, &mut shutdown_rx).await {
            Ok(()) => {
                info!("gateway session closed on request");
                break;
            }
            Err(error) if error.is_fatal() => {
                error!(%error, "fatal gateway configuration error, reconnection disabled");
                can_reconnect.store(false, Ordering::SeqCst);
                break;
            }
            Err(GatewayError::ConnectionDropped(detail)) => {
                warn!(%detail, "gateway connection dropped, pausing before reconnect");
                retries.store(0, Ordering::SeqCst);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(CONNECTION_DROP_DELAY) => {}
                }
            }
            Err(GatewayError::StreamClosed(detail)) => {
                debug!(%detail, "gateway stream closed");
            }
            Err(error) => {
                error!(%error, "gateway session failed");
            }
        }
        info!(
            retries = retries.load(Ordering::SeqCst),
            "gateway disconnected"
        );
    }
    info!("relay connection loop stopped");
}

struct Cooldowns {
    builtin_public: Option<Instant>,
    builtin_staff: Option<Instant>,
    unauthorized: Option<Instant>,
}

impl Cooldowns {
    fn new() -> Self {
        Self {
            builtin_public: None,
            builtin_staff: None,
            // Hot at startup: an unauthorized burst right after connecting
            // stays silent until the window has passed once.
            unauthorized: Some(Instant::now()),
        }
    }

    fn allow(slot: &mut Option<Instant>, window: Duration) -> bool {
        let now = Instant::now();
        match slot {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                *slot = Some(now);
                true
            }
        }
    }
}

/// Routes decoded gateway events. Runs on the session task; everything here
/// either mutates small in-memory state or enqueues.
struct EventRouter {
    config: Arc<RelayConfig>,
    dispatcher: ApiDispatcher,
    commands: Arc<dyn CommandHost>,
    chat: Arc<dyn ChatHost>,
    retries: Arc<AtomicU32>,
    public_channels: HashSet<String>,
    staff_channels: HashSet<String>,
    ignored_users: HashSet<String>,
    controllers: HashSet<String>,
    banned_commands: HashSet<String>,
    /// Channels learned to be direct-message kind.
    dm_channels: HashSet<String>,
    bot_user_id: Option<String>,
    cooldowns: Cooldowns,
}

impl EventRouter {
    fn new(
        config: Arc<RelayConfig>,
        dispatcher: ApiDispatcher,
        commands: Arc<dyn CommandHost>,
        chat: Arc<dyn ChatHost>,
        retries: Arc<AtomicU32>,
    ) -> Self {
        let public_channels = config.public_channel_ids.iter().cloned().collect();
        let staff_channels = config.staff_channel_ids.iter().cloned().collect();
        let ignored_users = config.ignored_user_ids.iter().cloned().collect();
        let controllers = config.controller_user_ids.iter().cloned().collect();
        let banned_commands = config
            .banned_commands
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        Self {
            config,
            dispatcher,
            commands,
            chat,
            retries,
            public_channels,
            staff_channels,
            ignored_users,
            controllers,
            banned_commands,
            dm_channels: HashSet::new(),
            bot_user_id: None,
            cooldowns: Cooldowns::new(),
        }
    }

    fn route_message(&mut self, message: InboundMessage) {
        if message.author.bot {
            return;
        }
        if self.bot_user_id.as_deref() == Some(message.author.id.as_str()) {
            return;
        }
        if self.ignored_users.contains(&message.author.id) {
            debug!(user_id = %message.author.id, "dropping message from ignored user");
            return;
        }

        let text = markdown::sanitize_inbound(&message.content);
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let mut user = RelayUser::new(message.author.id.clone(), message.author.username.clone());
        user.prefix = self.config.nick_prefix.clone();

        if self.is_direct_channel(&message) {
            // Private messages always run with elevated controller context.
            self.handle_command(&user, &message.channel_id, text);
        } else if self.public_channels.contains(&message.channel_id)
            || self.staff_channels.contains(&message.channel_id)
        {
            self.handle_channel_message(&user, &message.channel_id, text);
        }
    }

    fn is_direct_channel(&self, message: &InboundMessage) -> bool {
        message.guild_id.is_none() || self.dm_channels.contains(&message.channel_id)
    }

    fn handle_channel_message(&mut self, user: &RelayUser, channel_id: &str, text: &str) {
        let staff = self.staff_channels.contains(channel_id);
        let first = text.split_whitespace().next().unwrap_or("");

        match first.to_ascii_lowercase().as_str() {
            ".who" => {
                if self.builtin_allowed(staff) {
                    self.send_who_list(channel_id);
                }
                return;
            }
            ".url" => {
                if self.builtin_allowed(staff) {
                    self.send_server_url(channel_id);
                }
                return;
            }
            _ => {}
        }

        if first == self.config.command_trigger {
            let rest = text[first.len()..].trim_start();
            self.handle_command(user, channel_id, rest);
            return;
        }

        self.chat.inject_chat(user, text, staff);
    }

    fn builtin_allowed(&mut self, staff: bool) -> bool {
        let slot = if staff {
            &mut self.cooldowns.builtin_staff
        } else {
            &mut self.cooldowns.builtin_public
        };
        Cooldowns::allow(slot, BUILTIN_COOLDOWN)
    }

    fn handle_command(&mut self, user: &RelayUser, channel_id: &str, line: &str) {
        if !self.controllers.contains(&user.id) {
            if Cooldowns::allow(
                &mut self.cooldowns.unauthorized,
                UNAUTHORIZED_NOTICE_COOLDOWN,
            ) {
                self.send_text(channel_id, "You are not authorized to run commands.");
            }
            return;
        }

        let line = line.trim();
        if line.is_empty() {
            self.send_text(channel_id, "No command given.");
            return;
        }
        let (name, args) = match line.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (line, ""),
        };
        let name = name.to_ascii_lowercase();

        if self.banned_commands.contains(&name) {
            self.send_text(
                channel_id,
                &format!("The {name} command is not allowed from the relay."),
            );
            return;
        }
        if !self.commands.command_exists(&name) {
            self.send_text(channel_id, "Unknown command.");
            return;
        }

        let mut actor = self.make_actor(user, channel_id);
        if let Err(error) = self.commands.execute(&name, args, &mut actor) {
            warn!(command = %name, %error, "relayed command failed");
            self.send_text(channel_id, &format!("Command failed: {error}"));
        }
    }

    fn make_actor(&self, user: &RelayUser, channel_id: &str) -> CommandActor {
        let dispatcher = self.dispatcher.clone();
        let channel = channel_id.to_string();
        let mentions = AllowedMentions::from_config(&self.config);
        CommandActor::new(
            user.display(),
            self.config.controller_rank,
            Box::new(move |text| {
                let sanitized = markdown::sanitize_outbound(text);
                for chunk in markdown::chunk_message(&sanitized, markdown::MAX_MESSAGE_CHARS) {
                    dispatcher.enqueue(OutboundMessage::text(channel.clone(), chunk, mentions));
                }
            }),
        )
    }

    fn send_who_list(&self, channel_id: &str) {
        let players = self.chat.online_players();
        let title = format!("{} player(s) currently online", players.len());

        if self.config.embeds_enabled {
            let mut groups: Vec<(String, Vec<String>)> = Vec::new();
            for player in players {
                match groups.iter_mut().find(|(group, _)| *group == player.group) {
                    Some((_, names)) => names.push(player.name),
                    None => groups.push((player.group, vec![player.name])),
                }
            }
            let fields = groups
                .into_iter()
                .map(|(group, names)| (group, names.join(", ")))
                .collect();
            self.dispatcher.enqueue(OutboundMessage::embed(
                channel_id,
                title,
                fields,
                self.config.embed_color,
            ));
        } else {
            let names: Vec<String> = players.into_iter().map(|player| player.name).collect();
            self.send_text(channel_id, &format!("{title}: {}", names.join(", ")));
        }
    }

    fn send_server_url(&self, channel_id: &str) {
        match self.chat.server_url() {
            // The URL goes out unescaped; escaping would corrupt the link.
            Some(url) => self.enqueue_raw(channel_id, &format!("{}: {url}", self.chat.server_name())),
            None => self.send_text(channel_id, "No server URL is published."),
        }
    }

    /// Sanitizes, chunks, and enqueues system or reply text.
    fn send_text(&self, channel_id: &str, text: &str) {
        self.enqueue_raw(channel_id, &markdown::sanitize_outbound(text));
    }

    fn enqueue_raw(&self, channel_id: &str, text: &str) {
        let mentions = AllowedMentions::from_config(&self.config);
        for chunk in markdown::chunk_message(text, markdown::MAX_MESSAGE_CHARS) {
            self.dispatcher
                .enqueue(OutboundMessage::text(channel_id, chunk, mentions));
        }
    }
}

impl GatewayEvents for EventRouter {
    fn on_ready(&mut self, bot_user_id: &str) {
        self.bot_user_id = Some(bot_user_id.to_string());
        self.retries.store(0, Ordering::SeqCst);
        info!(bot_user_id, "relay ready");
    }

    fn on_resumed(&mut self) {
        info!("relay session resumed");
    }

    fn on_message(&mut self, message: InboundMessage) {
        self.route_message(message);
    }

    fn on_channel_create(&mut self, channel: CreatedChannel) {
        if channel.is_direct() {
            self.dm_channels.insert(channel.id);
        }
    }
}
