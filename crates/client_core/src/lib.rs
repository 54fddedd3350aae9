//! Message synchronization core for chat frontends.
//!
//! [`ChatClient`] owns the REST session, the gateway connection and the
//! in-memory message store, and exposes a broadcast event stream the UI
//! renders from. Message sends travel over REST with an optimistic local
//! insert; the gateway carries broadcasts, receipts, typing and presence.

pub mod connection;
pub mod delivery;
pub mod error;
pub mod notify;
pub mod presence;
pub mod reconcile;

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, ChatKind, FileId, MessageId, MessageType, UserId},
    error::ApiError,
    protocol::{AttachmentPayload, ChatSummary, ClientFrame, GatewayEvent, MessagePayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionNotice, ConnectionStatus,
};
pub use crate::delivery::{DeliveryStatus, SeenRecord};
pub use crate::error::ClientError;
pub use crate::notify::{NoopNotificationBridge, NotificationBridge, NotificationPayload};
pub use crate::presence::{PresenceRecord, PresenceTracker};
pub use crate::reconcile::{ChatStore, MergeOutcome, Message};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TYPING_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// UI-facing state change notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    ReconnectsExhausted { attempts: u32 },
    /// A chat's message list changed (insert, upgrade, receipt, reaction).
    MessagesChanged { chat_id: ChatId },
    /// A send failed permanently; the entry stays visible with an `error`
    /// badge until retried or dismissed.
    MessageFailed { chat_id: ChatId, client_ref: String },
    TypingChanged { chat_id: ChatId, user_id: UserId, is_typing: bool },
    PresenceChanged { user_id: UserId, is_online: bool },
    ServerError(ApiError),
}

/// Raw bytes handed to [`ChatClient::send_file`]; reading from disk is the
/// frontend's job.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct SendMessageRequest {
    chat_id: ChatId,
    content: String,
    message_type: MessageType,
    client_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<AttachmentPayload>,
}

#[derive(Debug)]
struct PendingSend {
    client_ref: String,
    request: SendMessageRequest,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Serialize)]
struct CreateChatRequest<'a> {
    kind: ChatKind,
    participants: &'a [UserId],
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Deserialize)]
struct FileUploadResponse {
    file_id: FileId,
    filename: String,
    size_bytes: u64,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    store: ChatStore,
    presence: PresenceTracker,
    focused_chat: Option<ChatId>,
    /// Sends attempted while the gateway was down, flushed FIFO on reopen.
    pending_sends: VecDeque<PendingSend>,
}

pub struct ChatClient {
    base_url: String,
    http: reqwest::Client,
    connection: Arc<ConnectionManager>,
    state: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    notifier: Arc<dyn NotificationBridge>,
    // std mutex so Drop can abort the pumps; never held across awaits.
    pumps: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Arc<Self> {
        Self::with_parts(
            base_url,
            ConnectionConfig::default(),
            Arc::new(NoopNotificationBridge),
        )
    }

    pub fn with_parts(
        base_url: impl Into<String>,
        config: ConnectionConfig,
        notifier: Arc<dyn NotificationBridge>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            connection: ConnectionManager::new(config),
            state: Mutex::new(ClientState::default()),
            events,
            notifier,
            pumps: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// App refocus / network-online hook: resets the backoff schedule and
    /// reconnects immediately.
    pub fn trigger_reconnect(&self) {
        self.connection.trigger_reconnect();
    }

    /// Network-offline hook: tears the socket down now; sends made in the
    /// meantime are queued.
    pub fn handle_offline(&self) {
        self.connection.handle_offline();
    }

    // ---- session -----------------------------------------------------

    /// Authenticates, starts the event pumps and opens the gateway
    /// connection. The pumps are running before the socket opens so no
    /// early event is lost.
    pub async fn login(
        self: &Arc<Self>,
        username: &str,
        password: &str,
    ) -> Result<UserId, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let login: LoginResponse = check_auth(response).await?.json().await?;
        let token = login.token.clone();
        {
            let mut state = self.state.lock().await;
            state.session = Some(Session {
                user_id: login.user_id,
                token,
            });
            state.store.clear();
        }
        info!(user_id = login.user_id.0, "logged in");
        self.spawn_pumps();
        self.connection
            .connect(&self.base_url, &login.token)
            .await?;
        Ok(login.user_id)
    }

    /// Deterministic teardown: connection, pumps and local state all go.
    pub async fn logout(&self) {
        self.connection.disconnect();
        self.abort_pumps();
        let mut state = self.state.lock().await;
        state.session = None;
        state.focused_chat = None;
        state.pending_sends.clear();
        state.store.clear();
        info!("logged out");
    }

    // ---- REST --------------------------------------------------------

    pub async fn load_chats(&self) -> Result<Vec<ChatSummary>, ClientError> {
        let token = self.require_token().await?;
        let response = self
            .http
            .get(format!("{}/api/chats", self.base_url))
            .bearer_auth(&token)
            .send()
            .await?;
        Ok(check_auth(response).await?.json().await?)
    }

    pub async fn create_chat(
        &self,
        kind: ChatKind,
        participants: &[UserId],
        name: Option<&str>,
    ) -> Result<ChatSummary, ClientError> {
        let token = self.require_token().await?;
        let response = self
            .http
            .post(format!("{}/api/chats", self.base_url))
            .bearer_auth(&token)
            .json(&CreateChatRequest {
                kind,
                participants,
                name,
            })
            .send()
            .await?;
        Ok(check_auth(response).await?.json().await?)
    }

    /// Fetches a page of a chat's history and merges it into the store.
    /// `before` pages backwards from a known message id; `limit` caps the
    /// page size (server default otherwise). Messages already present
    /// (optimistic or gateway-delivered) are upgraded in place, never
    /// duplicated.
    pub async fn load_history(
        &self,
        chat_id: ChatId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<usize, ClientError> {
        let token = self.require_token().await?;
        let mut request = self
            .http
            .get(format!(
                "{}/api/chats/{}/messages",
                self.base_url, chat_id.0
            ))
            .bearer_auth(&token);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        if let Some(before) = before {
            request = request.query(&[("before", before.0.to_string())]);
        }
        let response = request.send().await?;
        let history: Vec<MessagePayload> = check_auth(response).await?.json().await?;
        let count = history.len();
        let mut state = self.state.lock().await;
        let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
            return Err(ClientError::NotLoggedIn("load_history"));
        };
        for payload in history {
            state.store.merge_inbound(payload, self_user);
        }
        drop(state);
        self.emit(ClientEvent::MessagesChanged { chat_id });
        Ok(count)
    }

    // ---- sending -----------------------------------------------------

    /// Sends a text message. The message appears in the local store
    /// immediately (status `sent`); the returned correlation id identifies
    /// it until the server assigns a real id. When the gateway is down the
    /// send is queued and flushed on reconnect.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<String, ClientError> {
        self.send_with_attachment(chat_id, content.into(), MessageType::Text, reply_to, None)
            .await
    }

    /// Uploads the attachment over REST, then sends a file message
    /// referencing it.
    pub async fn send_file(
        &self,
        chat_id: ChatId,
        upload: AttachmentUpload,
        caption: impl Into<String>,
    ) -> Result<String, ClientError> {
        let attachment = self.upload_file(upload).await?;
        self.send_with_attachment(
            chat_id,
            caption.into(),
            MessageType::File,
            None,
            Some(attachment),
        )
        .await
    }

    async fn send_with_attachment(
        &self,
        chat_id: ChatId,
        content: String,
        message_type: MessageType,
        reply_to: Option<MessageId>,
        attachment: Option<AttachmentPayload>,
    ) -> Result<String, ClientError> {
        let client_ref = Uuid::new_v4().to_string();
        let request = SendMessageRequest {
            chat_id,
            content: content.clone(),
            message_type,
            client_ref: client_ref.clone(),
            reply_to,
            attachment: attachment.clone(),
        };

        let typing_stop = {
            let mut state = self.state.lock().await;
            let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                return Err(ClientError::NotLoggedIn("send_message"));
            };
            state.store.insert_optimistic(Message {
                id: None,
                client_ref: Some(client_ref.clone()),
                chat_id,
                sender_id: self_user,
                sender_username: None,
                content,
                message_type,
                attachment,
                reply_to,
                sent_at: Utc::now(),
                status: DeliveryStatus::Sent,
                seen_by: Vec::new(),
                reactions: std::collections::BTreeMap::new(),
                edited: false,
                edited_at: None,
            });
            state.presence.note_message_sent(chat_id)
        };
        self.emit(ClientEvent::MessagesChanged { chat_id });
        if let Some(frame) = typing_stop {
            self.connection.send(frame).await;
        }

        if !self.connection.is_connected() {
            {
                let mut state = self.state.lock().await;
                state.pending_sends.push_back(PendingSend {
                    client_ref: client_ref.clone(),
                    request,
                });
            }
            info!(chat_id = chat_id.0, "gateway down, send queued");
            // The gateway may have opened between the check and the enqueue,
            // in which case the reconnect flush already ran and missed this
            // entry. Re-check and drain so it is not stranded.
            if self.connection.is_connected() {
                self.flush_pending_sends().await;
            }
            return Ok(client_ref);
        }

        self.perform_send(&client_ref, &request).await?;
        Ok(client_ref)
    }

    /// Removes a failed entry and resends it as a fresh message with a new
    /// correlation id. Confirmed messages are not retryable.
    pub async fn retry_message(
        &self,
        chat_id: ChatId,
        client_ref: &str,
    ) -> Result<String, ClientError> {
        let failed = {
            let mut state = self.state.lock().await;
            state.store.take_failed(chat_id, client_ref)
        };
        let Some(failed) = failed else {
            return Err(ClientError::Send(format!(
                "no failed message with ref {client_ref}"
            )));
        };
        self.emit(ClientEvent::MessagesChanged { chat_id });
        self.send_with_attachment(
            chat_id,
            failed.content,
            failed.message_type,
            failed.reply_to,
            failed.attachment,
        )
        .await
    }

    async fn perform_send(
        &self,
        client_ref: &str,
        request: &SendMessageRequest,
    ) -> Result<(), ClientError> {
        let token = self.require_token().await?;
        let outcome = async {
            let response = self
                .http
                .post(format!("{}/api/messages", self.base_url))
                .bearer_auth(&token)
                .json(request)
                .send()
                .await?;
            let payload: MessagePayload = check_auth(response).await?.json().await?;
            Ok::<_, ClientError>(payload)
        }
        .await;

        match outcome {
            Ok(payload) => {
                let chat_id = payload.chat_id;
                let mut state = self.state.lock().await;
                let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                    return Err(ClientError::NotLoggedIn("send_message"));
                };
                state.store.reconcile_ack(client_ref, payload, self_user);
                drop(state);
                self.emit(ClientEvent::MessagesChanged { chat_id });
                Ok(())
            }
            Err(err) => {
                // Transport/server rejections are send failures; auth keeps
                // its own variant so callers can prompt for re-login.
                let err = match err {
                    ClientError::Http(reason) => ClientError::Send(reason),
                    other => other,
                };
                warn!(client_ref, "send failed: {err}");
                let mut state = self.state.lock().await;
                state.store.mark_send_failed(client_ref);
                drop(state);
                self.emit(ClientEvent::MessageFailed {
                    chat_id: request.chat_id,
                    client_ref: client_ref.to_string(),
                });
                self.emit(ClientEvent::MessagesChanged {
                    chat_id: request.chat_id,
                });
                Err(err)
            }
        }
    }

    async fn upload_file(&self, upload: AttachmentUpload) -> Result<AttachmentPayload, ClientError> {
        let token = self.require_token().await?;
        let mut request = self
            .http
            .post(format!("{}/api/files", self.base_url))
            .bearer_auth(&token)
            .query(&[("filename", upload.filename.as_str())])
            .body(upload.bytes);
        if let Some(mime) = &upload.mime_type {
            request = request.header(reqwest::header::CONTENT_TYPE, mime);
        }
        let response = request.send().await?;
        let uploaded: FileUploadResponse = check_auth(response).await?.json().await?;
        Ok(AttachmentPayload {
            file_id: uploaded.file_id,
            filename: uploaded.filename,
            size_bytes: uploaded.size_bytes,
            mime_type: uploaded.mime_type,
        })
    }

    // ---- focus, typing, reactions -------------------------------------

    /// Sets which chat the user is looking at. Focusing a chat marks it
    /// read on the server; incoming messages for the focused chat never
    /// raise notifications.
    pub async fn set_focused_chat(&self, chat_id: Option<ChatId>) {
        {
            let mut state = self.state.lock().await;
            state.focused_chat = chat_id;
        }
        if let Some(chat_id) = chat_id {
            if let Err(err) = self.mark_chat_read(chat_id).await {
                warn!(chat_id = chat_id.0, "mark read failed: {err}");
            }
        }
    }

    /// Marks every message in the chat delivered: broadcast frame for the
    /// live participants, REST update so the state survives the socket.
    pub async fn mark_chat_delivered(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.connection
            .send(ClientFrame::MarkDelivered { chat_id })
            .await;
        self.post_receipt(chat_id, "delivered").await
    }

    /// Marks every message in the chat read, frame and REST both.
    pub async fn mark_chat_read(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.connection.send(ClientFrame::MarkRead { chat_id }).await;
        self.post_receipt(chat_id, "read").await
    }

    async fn post_receipt(&self, chat_id: ChatId, receipt: &str) -> Result<(), ClientError> {
        let token = self.require_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/api/chats/{}/{receipt}",
                self.base_url, chat_id.0
            ))
            .bearer_auth(&token)
            .send()
            .await?;
        check_auth(response).await?;
        Ok(())
    }

    /// Local keystroke hook. The first keystroke of a burst broadcasts
    /// `typing:true`; the trailing `typing:false` goes out after the quiet
    /// period via the poll pump.
    pub async fn notify_typing(&self, chat_id: ChatId) {
        let frame = {
            let mut state = self.state.lock().await;
            state.presence.note_local_typing(chat_id, std::time::Instant::now())
        };
        if let Some(frame) = frame {
            self.connection.send(frame).await;
        }
    }

    /// Adds a reaction optimistically and broadcasts it. Duplicate
    /// reactions are no-ops locally and idempotent on the wire.
    pub async fn react(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<(), ClientError> {
        let emoji = emoji.into();
        let changed = {
            let mut state = self.state.lock().await;
            let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                return Err(ClientError::NotLoggedIn("react"));
            };
            state
                .store
                .apply_reaction(chat_id, message_id, &emoji, self_user)
        };
        if changed {
            self.emit(ClientEvent::MessagesChanged { chat_id });
        }
        self.connection
            .send(ClientFrame::Reaction {
                chat_id,
                message_id,
                emoji,
            })
            .await;
        Ok(())
    }

    // ---- read accessors ------------------------------------------------

    pub async fn messages(&self, chat_id: ChatId) -> Vec<Message> {
        self.state.lock().await.store.messages(chat_id).to_vec()
    }

    pub async fn typing_users(&self, chat_id: ChatId) -> Vec<UserId> {
        self.state.lock().await.presence.typing_users(chat_id)
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.lock().await.presence.is_online(user_id)
    }

    pub async fn presence(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.state.lock().await.presence.presence(user_id).cloned()
    }

    // ---- pumps ---------------------------------------------------------

    // The pumps hold only a `Weak` back-reference: dropping the last
    // external handle ends them instead of leaking an Arc cycle.
    fn spawn_pumps(self: &Arc<Self>) {
        let mut pumps = self
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for pump in pumps.drain(..) {
            pump.abort();
        }

        let gateway_rx = self.connection.subscribe_events();
        pumps.push(tokio::spawn(Self::pump_gateway(
            Arc::downgrade(self),
            gateway_rx,
        )));

        let notices_rx = self.connection.subscribe_notices();
        pumps.push(tokio::spawn(Self::pump_notices(
            Arc::downgrade(self),
            notices_rx,
        )));

        pumps.push(tokio::spawn(Self::pump_typing(Arc::downgrade(self))));
    }

    fn abort_pumps(&self) {
        for pump in self
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            pump.abort();
        }
    }

    async fn pump_gateway(weak: Weak<Self>, mut rx: broadcast::Receiver<GatewayEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(client) = weak.upgrade() else { break };
                    client.handle_gateway_event(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "gateway event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn pump_notices(weak: Weak<Self>, mut rx: broadcast::Receiver<ConnectionNotice>) {
        loop {
            let notice = match rx.recv().await {
                Ok(notice) => notice,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection notice consumer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(client) = weak.upgrade() else { break };
            match notice {
                ConnectionNotice::Opened => {
                    client.emit(ClientEvent::Connected);
                    client.flush_pending_sends().await;
                }
                ConnectionNotice::Closed => client.emit(ClientEvent::Disconnected),
                ConnectionNotice::ReconnectsExhausted { attempts } => {
                    client.emit(ClientEvent::ReconnectsExhausted { attempts });
                }
            }
        }
    }

    async fn pump_typing(weak: Weak<Self>) {
        let mut tick = interval(TYPING_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(client) = weak.upgrade() else { break };
            let frames = {
                let mut state = client.state.lock().await;
                state.presence.poll_expired(std::time::Instant::now())
            };
            for frame in frames {
                client.connection.send(frame).await;
            }
        }
    }

    /// Drains the queue of sends attempted while offline, in order.
    async fn flush_pending_sends(&self) {
        loop {
            let pending = {
                let mut state = self.state.lock().await;
                state.pending_sends.pop_front()
            };
            let Some(pending) = pending else { break };
            if let Err(err) = self.perform_send(&pending.client_ref, &pending.request).await {
                warn!(client_ref = pending.client_ref, "queued send failed: {err}");
            }
        }
    }

    async fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::NewMessage { message } => self.handle_new_message(message).await,
            GatewayEvent::Typing {
                chat_id,
                user_id,
                is_typing,
            } => {
                let mut state = self.state.lock().await;
                state.presence.apply_remote_typing(chat_id, user_id, is_typing);
                drop(state);
                self.emit(ClientEvent::TypingChanged {
                    chat_id,
                    user_id,
                    is_typing,
                });
            }
            GatewayEvent::MessagesDelivered { chat_id } => {
                let changed = {
                    let mut state = self.state.lock().await;
                    let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                        return;
                    };
                    state.store.apply_delivered(chat_id, self_user)
                };
                if changed > 0 {
                    self.emit(ClientEvent::MessagesChanged { chat_id });
                }
            }
            GatewayEvent::MessagesRead {
                chat_id,
                user_id,
                username,
                seen_at,
            } => {
                let changed = {
                    let mut state = self.state.lock().await;
                    let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                        return;
                    };
                    state
                        .store
                        .apply_read(chat_id, user_id, username, seen_at, self_user)
                };
                if changed > 0 {
                    self.emit(ClientEvent::MessagesChanged { chat_id });
                }
            }
            GatewayEvent::Reaction {
                chat_id,
                message_id,
                emoji,
                user_id,
            } => {
                let changed = {
                    let mut state = self.state.lock().await;
                    state.store.apply_reaction(chat_id, message_id, &emoji, user_id)
                };
                if changed {
                    self.emit(ClientEvent::MessagesChanged { chat_id });
                }
            }
            GatewayEvent::UserStatus {
                user_id,
                is_online,
                last_seen,
            } => {
                let mut state = self.state.lock().await;
                state.presence.apply_user_status(user_id, is_online, last_seen);
                drop(state);
                self.emit(ClientEvent::PresenceChanged { user_id, is_online });
            }
            GatewayEvent::Error(error) => {
                warn!(code = ?error.code, "server error: {}", error.message);
                self.emit(ClientEvent::ServerError(error));
            }
            // Answered inside the connection layer, never forwarded here.
            GatewayEvent::Ping { .. } | GatewayEvent::Pong { .. } => {}
        }
    }

    async fn handle_new_message(&self, message: MessagePayload) {
        let chat_id = message.chat_id;
        let (outcome, notification, mark) = {
            let mut state = self.state.lock().await;
            let Some(self_user) = state.session.as_ref().map(|s| s.user_id) else {
                return;
            };
            let from_other = message.sender_id != self_user;
            let notification = notify::should_notify(&message, self_user, state.focused_chat)
                .then(|| NotificationPayload::from_message(&message));
            let focused = state.focused_chat == Some(chat_id);
            let outcome = state.store.merge_inbound(message, self_user);
            // Receiving the broadcast is what makes the message delivered;
            // reading it additionally requires focus.
            let mark = (from_other && outcome == MergeOutcome::Inserted).then_some(focused);
            (outcome, notification, mark)
        };

        self.emit(ClientEvent::MessagesChanged { chat_id });
        if let Some(focused) = mark {
            let acknowledged = if focused {
                self.mark_chat_read(chat_id).await
            } else {
                self.mark_chat_delivered(chat_id).await
            };
            if let Err(err) = acknowledged {
                warn!(chat_id = chat_id.0, "receipt update failed: {err}");
            }
        }
        if outcome == MergeOutcome::Inserted {
            if let Some(notification) = notification {
                self.notifier.notify(notification).await;
            }
        }
    }

    // ---- helpers -------------------------------------------------------

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn require_token(&self) -> Result<String, ClientError> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.token.clone())
            .ok_or(ClientError::NotLoggedIn("no active session"))
    }
}

// Dropping the last handle must not leave the heartbeat, backoff or typing
// timers running.
impl Drop for ChatClient {
    fn drop(&mut self) {
        self.abort_pumps();
        self.connection.disconnect();
    }
}

/// Maps a 401 to [`ClientError::Auth`] without tearing the session down;
/// the caller surfaces it and the user retries. Everything else non-2xx
/// becomes a generic HTTP error.
async fn check_auth(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Auth(body));
    }
    Ok(response.error_for_status()?)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
