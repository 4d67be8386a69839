//! Per-socket chat protocol.
//!
//! Lifecycle: `Connecting -> Authorized -> Active -> Closing -> Closed`.
//! While active three loops share the socket: the command reader, the
//! keepalive pinger and the fan-out listener. They write through one
//! mutex-guarded writer, and the first loop to finish ends the other two.
//!
//! The handler is generic over the socket halves so tests can drive it with
//! in-memory channels.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use chrono::Utc;
use futures::future::join_all;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use spark_buffer::Subscription;
use spark_shared::constants::{DEFAULT_QUERY_LIMIT, MESSAGE_ID_LEN, REACTION_ID_LEN};
use spark_shared::protocol::{ClientFrame, EventName, IncomingMedia, IncomingMessage, ServerFrame};
use spark_shared::{generate_id, EventEnvelope, Media, Message, MessagePatch, ProtocolError, Reaction};

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::rate_limit::CommandLimiter;
use crate::session::{ChatServices, ChatSession};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
    /// Read deadline, refreshed by every frame received.
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_ping_retries: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(90),
            write_wait: Duration::from_secs(30),
            max_ping_retries: 3,
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_wait: config.pong_wait,
            write_wait: config.write_wait,
            max_ping_retries: config.max_ping_retries.max(1),
        }
    }
}

/// Everything a connection needs besides its socket.
#[derive(Clone)]
pub struct ConnectionContext {
    pub services: ChatServices,
    pub settings: ConnectionSettings,
    /// Command budgets. `None` disables them.
    pub limiter: Option<CommandLimiter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorized,
    Active,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Unauthorized,
    SessionFailed(String),
    ClientClosed,
    ReadTimeout,
    ReadError(String),
    KeepaliveFailed,
    SubscriptionClosed,
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,

    #[error("socket write failed: {0}")]
    Sink(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Writer<S> {
    sink: Mutex<S>,
    write_wait: Duration,
}

impl<S> Writer<S>
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    fn new(sink: S, write_wait: Duration) -> Self {
        Self {
            sink: Mutex::new(sink),
            write_wait,
        }
    }

    async fn send(&self, msg: WsMessage) -> Result<(), WriteError> {
        let mut sink = self.sink.lock().await;
        match timeout(self.write_wait, sink.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    async fn send_frame(&self, frame: &ServerFrame) -> Result<(), WriteError> {
        self.send(WsMessage::Text(frame.to_json()?)).await
    }

    /// Best-effort close frame, then close the sink.
    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = timeout(self.write_wait, sink.send(WsMessage::Close(None))).await;
        let _ = timeout(self.write_wait, sink.close()).await;
    }
}

struct Lifecycle<'a> {
    chat_id: &'a str,
    user_id: &'a str,
    state: ConnectionState,
}

impl Lifecycle<'_> {
    fn advance(&mut self, next: ConnectionState) {
        debug!(
            chat_id = self.chat_id,
            user_id = self.user_id,
            from = ?self.state,
            to = ?next,
            "Connection state"
        );
        self.state = next;
    }
}

/// Run one chat connection to completion.
pub async fn serve_connection<S, R, E>(
    ctx: ConnectionContext,
    chat_id: String,
    user_id: String,
    sink: S,
    mut stream: R,
) -> ExitReason
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: Display + Send,
{
    let settings = ctx.settings;
    let writer = Writer::new(sink, settings.write_wait);
    let mut lifecycle = Lifecycle {
        chat_id: &chat_id,
        user_id: &user_id,
        state: ConnectionState::Connecting,
    };

    let session = match ChatSession::open(ctx.services.clone(), &chat_id, &user_id).await {
        Ok(session) => session,
        Err(e) => {
            let (frame, reason) = if matches!(e, ChatError::Unauthorized) {
                (
                    ServerFrame::unauthorized(e.to_string()),
                    ExitReason::Unauthorized,
                )
            } else {
                (
                    ServerFrame::error(e.to_string()),
                    ExitReason::SessionFailed(e.to_string()),
                )
            };
            let _ = writer.send_frame(&frame).await;
            lifecycle.advance(ConnectionState::Closing);
            writer.close().await;
            lifecycle.advance(ConnectionState::Closed);
            return reason;
        }
    };
    lifecycle.advance(ConnectionState::Authorized);

    let subscription = match session.subscribe().await {
        Ok(sub) => sub,
        Err(e) => {
            let _ = writer.send_frame(&ServerFrame::error(e.to_string())).await;
            lifecycle.advance(ConnectionState::Closing);
            writer.close().await;
            lifecycle.advance(ConnectionState::Closed);
            return ExitReason::SessionFailed(e.to_string());
        }
    };
    lifecycle.advance(ConnectionState::Active);
    info!(
        chat_id = %chat_id,
        user_id = %user_id,
        peer = ?session.participants().other(&user_id),
        "Chat connection active"
    );

    let reason = tokio::select! {
        reason = read_loop(&mut stream, &session, &writer, settings, ctx.limiter.as_ref()) => reason,
        reason = keepalive(&writer, settings) => reason,
        reason = listen(subscription, &session, &writer) => reason,
    };

    lifecycle.advance(ConnectionState::Closing);
    writer.close().await;
    lifecycle.advance(ConnectionState::Closed);
    info!(chat_id = %chat_id, user_id = %user_id, ?reason, "Chat connection closed");
    reason
}

async fn read_loop<S, R, E>(
    stream: &mut R,
    session: &ChatSession,
    writer: &Writer<S>,
    settings: ConnectionSettings,
    limiter: Option<&CommandLimiter>,
) -> ExitReason
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: Display + Send,
{
    loop {
        let incoming = match timeout(settings.pong_wait, stream.next()).await {
            Err(_) => return ExitReason::ReadTimeout,
            Ok(None) => return ExitReason::ClientClosed,
            Ok(Some(Err(e))) => return ExitReason::ReadError(e.to_string()),
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match incoming {
            WsMessage::Text(text) => text,
            WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let frame = ServerFrame::error(
                        ProtocolError::Unsupported("binary frame is not UTF-8").to_string(),
                    );
                    reply(session, writer, &frame).await;
                    continue;
                }
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => return ExitReason::ClientClosed,
        };

        if let Some(limiter) = limiter {
            let verdict = limiter.admit(session.chat_id(), session.user_id()).await;
            if let Some(refusal) = verdict.message() {
                warn!(chat_id = session.chat_id(), user_id = session.user_id(), ?verdict, "Command rate limit exceeded");
                reply(session, writer, &ServerFrame::error(refusal)).await;
                continue;
            }
        }

        if let Some(frame) = dispatch(session, &text).await {
            reply(session, writer, &frame).await;
        }
    }
}

async fn reply<S>(session: &ChatSession, writer: &Writer<S>, frame: &ServerFrame)
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    if let Err(e) = writer.send_frame(frame).await {
        warn!(chat_id = session.chat_id(), error = %e, "Failed to write reply");
    }
}

/// Decode and run one client command. Returns the frame to send back.
async fn dispatch(session: &ChatSession, text: &str) -> Option<ServerFrame> {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => return Some(ServerFrame::error(e.to_string())),
    };
    match handle_command(session, frame).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(chat_id = session.chat_id(), error = %e, "Command failed");
            Some(ServerFrame::error(e.to_string()))
        }
    }
}

async fn handle_command(
    session: &ChatSession,
    frame: ClientFrame,
) -> Result<Option<ServerFrame>, ChatError> {
    match frame.command()? {
        EventName::MessageSent => {
            let incoming = frame.message.ok_or(ProtocolError::MissingField("message"))?;
            session.send_message(new_message(incoming)).await?;
            Ok(None)
        }
        EventName::MessageUpdated => {
            let (id, incoming) = target(frame.message, "message")?;
            let media = (!incoming.media.is_empty()).then(|| new_media(incoming.media));
            let patch = MessagePatch {
                content: Some(incoming.content),
                kind: incoming.kind,
                media,
                ..MessagePatch::default()
            };
            session.update_message(&id, patch).await?;
            Ok(None)
        }
        EventName::TypingStarted => {
            session.send_typing_event().await?;
            Ok(None)
        }
        EventName::TypingStopped => {
            session.stop_typing_event().await?;
            Ok(None)
        }
        EventName::ReactionAdded => {
            let reaction = frame
                .reaction
                .filter(|r| !r.message_id.is_empty() && !r.reaction.is_empty())
                .ok_or(ProtocolError::MissingField("reaction"))?;
            let added = Reaction {
                id: generate_id(REACTION_ID_LEN),
                sender_id: session.user_id().to_string(),
                content: reaction.reaction,
                created_at: Utc::now(),
            };
            session
                .update_message(&reaction.message_id, MessagePatch::add_reaction(added))
                .await?;
            Ok(None)
        }
        EventName::ReactionRemoved => {
            let reaction = frame
                .reaction
                .filter(|r| !r.message_id.is_empty())
                .ok_or(ProtocolError::MissingField("message id"))?;
            let patch = MessagePatch::remove_reactions(session.user_id(), reaction.reaction);
            session.update_message(&reaction.message_id, patch).await?;
            Ok(None)
        }
        EventName::MessageReceived => {
            let (id, _) = target(frame.message, "message id")?;
            session.update_message(&id, MessagePatch::received()).await?;
            Ok(None)
        }
        EventName::MessageSeen => {
            let ids = frame
                .mark_seen
                .filter(|ids| !ids.is_empty())
                .ok_or(ProtocolError::MissingField("mark_seen array"))?;
            session.mark_messages_seen(&ids, session.user_id()).await?;
            Ok(None)
        }
        EventName::QueryMessages => {
            let query = frame
                .message_query
                .ok_or(ProtocolError::MissingField("message query"))?;
            let limit = if query.limit == 0 {
                DEFAULT_QUERY_LIMIT
            } else {
                query.limit
            };
            let messages = session
                .get_messages(limit, query.before_id.as_deref())
                .await?;
            Ok(Some(ServerFrame::messages(
                EventName::MessagesQuerySuccess,
                messages,
            )))
        }
        EventName::MessagesQuerySuccess | EventName::Error | EventName::Unauthorized => {
            Err(ProtocolError::Unsupported("server-only event").into())
        }
    }
}

/// The message a command refers to, which must carry an id.
fn target(
    message: Option<IncomingMessage>,
    field: &'static str,
) -> Result<(String, IncomingMessage), ProtocolError> {
    let mut message = message.ok_or(ProtocolError::MissingField(field))?;
    let id = message
        .id
        .take()
        .filter(|id| !id.is_empty())
        .ok_or(ProtocolError::MissingField(field))?;
    Ok((id, message))
}

fn new_message(incoming: IncomingMessage) -> Message {
    let created_at = incoming.created_at.unwrap_or_else(Utc::now);
    Message {
        id: generate_id(MESSAGE_ID_LEN),
        kind: incoming.kind.unwrap_or_default(),
        content: incoming.content,
        sender_id: String::new(),
        received: false,
        seen: false,
        media: new_media(incoming.media),
        reactions: Vec::new(),
        created_at,
        updated_at: created_at,
    }
}

fn new_media(items: Vec<IncomingMedia>) -> Vec<Media> {
    let now = Utc::now();
    items
        .into_iter()
        .map(|m| Media {
            id: generate_id(MESSAGE_ID_LEN),
            kind: m.kind,
            url: m.url,
            created_at: m.created_at.unwrap_or(now),
        })
        .collect()
}

async fn keepalive<S>(writer: &Writer<S>, settings: ConnectionSettings) -> ExitReason
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    let mut ticker = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    let mut failures = 0u32;
    loop {
        ticker.tick().await;
        match writer.send(WsMessage::Ping(Vec::new())).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(
                    attempt = failures,
                    max = settings.max_ping_retries,
                    error = %e,
                    "Ping failed"
                );
                if failures >= settings.max_ping_retries {
                    return ExitReason::KeepaliveFailed;
                }
            }
        }
    }
}

async fn listen<S>(mut subscription: Subscription, session: &ChatSession, writer: &Writer<S>) -> ExitReason
where
    S: Sink<WsMessage> + Unpin + Send,
    S::Error: Display,
{
    while let Some(event) = subscription.recv().await {
        if event.author() == session.user_id() {
            continue;
        }
        let frame = translate(event, session).await;
        if let Err(e) = writer.send_frame(&frame).await {
            warn!(chat_id = session.chat_id(), error = %e, "Failed to forward event");
        }
    }
    ExitReason::SubscriptionClosed
}

/// The frame a subscriber sees for an event authored by someone else.
async fn translate(event: EventEnvelope, session: &ChatSession) -> ServerFrame {
    match event {
        EventEnvelope::Message { message } => {
            ServerFrame::messages(EventName::MessageSent, vec![message])
        }
        EventEnvelope::Update {
            message,
            content_changed,
            ..
        } => {
            let name = update_event_name(&message, content_changed);
            ServerFrame::messages(name, vec![message])
        }
        EventEnvelope::Typing(typing) => ServerFrame::event(if typing.is_typing {
            EventName::TypingStarted
        } else {
            EventName::TypingStopped
        }),
        EventEnvelope::Seen(seen) => {
            let lookups = seen
                .message_ids
                .iter()
                .map(|id| session.get_message_by_id(id));
            let messages = join_all(lookups)
                .await
                .into_iter()
                .filter_map(|found| match found {
                    Ok(message) => Some(message),
                    Err(e) => {
                        debug!(chat_id = session.chat_id(), error = %e, "Seen lookup failed");
                        None
                    }
                })
                .collect();
            ServerFrame::messages(EventName::MessageSeen, messages)
        }
    }
}

fn update_event_name(message: &Message, content_changed: bool) -> EventName {
    if content_changed {
        EventName::MessageUpdated
    } else if message.received {
        EventName::MessageReceived
    } else if message.seen {
        EventName::MessageSeen
    } else {
        EventName::MessageUpdated
    }
}
