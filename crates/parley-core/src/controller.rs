//! Wires the connection, the pacing scheduler and the conversation log
//! together and drives them from a single task.
//!
//! All decisions happen in synchronous handlers that take the current time
//! as an argument. `run` is a thin async loop that feeds them user input,
//! link events, finished background requests and timer expirations, then
//! publishes a fresh `ChatView` for the front-end.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, TransportMode};
use crate::connection::{ConnectionManager, ConnectionState, SendOutcome, StatusChange};
use crate::conversation::{ConversationState, TurnPhase};
use crate::error::{ChatError, ChatResult};
use crate::http::{ApiClient, HealthReport};
use crate::jitter::{Jitter, RandomJitter};
use crate::predict::{self, Predictor};
use crate::protocol::{HistoryEntry, InboundEvent, RawReply};
use crate::scheduler::{ChunkScheduler, Fragment};
use crate::state::{Message, TurnId};
use crate::timer::{earliest, TimerSlot};
use crate::transport::{TaggedLinkEvent, Transport, WsTransport};

/// Something the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    SendText(String),
    SendVoice { audio: Vec<u8>, file_name: String },
    Reconnect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BotStatus {
    #[default]
    Idle,
    Thinking,
    Generating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioStatus {
    Fetching,
    Ready(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionView {
    pub state: ConnectionState,
    pub last_status: Option<StatusChange>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_at: Option<Instant>,
}

/// Snapshot of everything a front-end renders
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatView {
    pub messages: Vec<Message>,
    /// Text of the in-progress assistant message
    pub streaming: Option<String>,
    pub bot_status: BotStatus,
    pub transport: TransportMode,
    pub connection: ConnectionView,
    pub api_health: Option<String>,
    /// Keyed by message order
    pub audio: HashMap<u64, AudioStatus>,
    pub session_id: Option<String>,
}

enum TaskEvent {
    Reply {
        turn: TurnId,
        speech: bool,
        result: ChatResult<RawReply>,
    },
    Health(ChatResult<HealthReport>),
    Audio {
        order: u64,
        result: ChatResult<PathBuf>,
    },
}

struct Mailbox {
    links: mpsc::UnboundedReceiver<TaggedLinkEvent>,
    tasks: mpsc::UnboundedReceiver<TaskEvent>,
}

pub struct ChatController {
    config: Config,
    connection: ConnectionManager,
    scheduler: ChunkScheduler,
    conversation: ConversationState,
    predictor: Box<dyn Predictor>,
    api: Option<ApiClient>,
    audio_dir: Option<PathBuf>,
    query: String,
    placeholder: TimerSlot<TurnId>,
    api_health: Option<String>,
    last_status: Option<StatusChange>,
    audio: HashMap<u64, AudioStatus>,
    tasks: mpsc::UnboundedSender<TaskEvent>,
    mailbox: Option<Mailbox>,
    view: watch::Sender<ChatView>,
}

impl ChatController {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        jitter: Box<dyn Jitter>,
    ) -> ChatResult<Self> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let api = match &config.api.base_url {
            Some(base_url) => Some(ApiClient::new(
                base_url,
                Duration::from_millis(config.api.timeout_ms),
            )?),
            None => None,
        };
        let (view, _) = watch::channel(ChatView::default());

        Ok(Self {
            connection: ConnectionManager::new(config.connection.clone(), transport, link_tx),
            scheduler: ChunkScheduler::new(config.pacing.clone(), jitter),
            conversation: ConversationState::new(config.pacing.merge_policy),
            predictor: predict::from_rules(&config.predictions),
            api,
            audio_dir: config.audio_dir(),
            query: String::new(),
            placeholder: TimerSlot::new(),
            api_health: None,
            last_status: None,
            audio: HashMap::new(),
            tasks: task_tx,
            mailbox: Some(Mailbox {
                links: link_rx,
                tasks: task_rx,
            }),
            view,
            config,
        })
    }

    /// Real WebSocket transport and random pacing
    pub fn with_defaults(config: Config) -> ChatResult<Self> {
        Self::new(config, Arc::new(WsTransport), Box::new(RandomJitter::new()))
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.subscribe()
    }

    /// Greet the user and open the channel
    pub fn start(&mut self) {
        if let Some(welcome) = self.config.welcome_message.clone() {
            self.conversation.append_system_message(&welcome);
        }
        if self.config.transport == TransportMode::WebSocket {
            self.connection.connect();
        }
        self.sync_connection_status();
    }

    pub fn handle_input(&mut self, input: UserInput, now: Instant) {
        match input {
            UserInput::SendText(text) => self.send_text(&text, now),
            UserInput::SendVoice { audio, file_name } => self.send_voice(audio, &file_name),
            UserInput::Reconnect => {
                info!("reconnect requested");
                self.connection.connect();
            }
            UserInput::Disconnect => {
                for turn in self.connection.disconnect() {
                    if turn == self.conversation.turn() {
                        self.abort_turn(ChatError::Connection("disconnected before sending".to_string()));
                    }
                }
            }
        }
        self.sync_connection_status();
    }

    pub fn handle_link(&mut self, event: TaggedLinkEvent, now: Instant) {
        if let Some(event) = self.connection.handle_link(event, now) {
            self.handle_inbound(event, now);
        }
        self.sync_connection_status();
    }

    /// Fire every timer that is due at `now`
    pub fn on_tick(&mut self, now: Instant) {
        let poll = self.connection.poll(now);
        for turn in poll.delivered {
            self.on_delivered(turn, now);
        }
        for turn in poll.undeliverable {
            if turn == self.conversation.turn() && self.conversation.in_flight() {
                self.on_undeliverable(turn);
            }
        }

        if self.placeholder.fire_if_current(now, self.conversation.turn())
            && self.conversation.phase() == TurnPhase::AwaitingResponse
        {
            let predicted = self.predictor.predict(&self.query);
            if let Some(fragment) = self.scheduler.inject_synthetic(predicted, now) {
                self.apply_fragments(vec![fragment]);
            }
        }

        let release = self.scheduler.poll(now);
        self.apply_fragments(release.fragments);
        if release.timed_out && self.conversation.in_flight() {
            self.finish_on_timeout();
        }

        self.sync_connection_status();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.connection.next_deadline(),
            self.scheduler.next_deadline(),
            self.placeholder.deadline(),
        ])
    }

    pub fn view(&self) -> ChatView {
        let streaming = self
            .conversation
            .streaming()
            .map(|slot| slot.display.clone());
        ChatView {
            messages: self.conversation.messages().to_vec(),
            streaming,
            bot_status: self.bot_status(),
            transport: self.config.transport,
            connection: ConnectionView {
                state: self.connection.state().clone(),
                last_status: self.last_status.clone(),
                attempt: self.connection.attempt_count(),
                max_attempts: self.connection.max_attempts(),
                retry_at: self.connection.reconnect_at(),
            },
            api_health: self.api_health.clone(),
            audio: self.audio.clone(),
            session_id: self.connection.session_token().map(str::to_string),
        }
    }

    /// Drive the controller until the input channel closes.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<UserInput>) {
        let Some(Mailbox {
            mut links,
            mut tasks,
        }) = self.mailbox.take()
        else {
            warn!("controller is already running");
            return;
        };

        self.start();
        self.spawn_health_check();
        self.publish();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input, Instant::now()),
                    None => break,
                },
                Some(event) = links.recv() => self.handle_link(event, Instant::now()),
                Some(event) = tasks.recv() => self.handle_task(event),
                _ = sleep_until(deadline) => self.on_tick(Instant::now()),
            }
            self.publish();
        }

        self.connection.disconnect();
        info!("controller stopped");
    }

    fn publish(&self) {
        self.view.send_replace(self.view());
    }

    fn bot_status(&self) -> BotStatus {
        match self.conversation.phase() {
            TurnPhase::Idle => BotStatus::Idle,
            TurnPhase::AwaitingResponse => BotStatus::Thinking,
            TurnPhase::Streaming => match self.conversation.streaming() {
                Some(slot) if slot.real_fragments > 0 => BotStatus::Generating,
                _ => BotStatus::Thinking,
            },
        }
    }

    fn use_http(&self) -> bool {
        match self.config.transport {
            TransportMode::Http => true,
            TransportMode::WebSocket => self.api.is_some() && self.connection.is_errored(),
        }
    }

    fn send_text(&mut self, text: &str, now: Instant) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let turn = self.begin_turn(text);
        let history = self.conversation.history();
        self.conversation.append_user_message(text);
        info!(%turn, "sending message");

        if self.use_http() {
            self.spawn_text_request(turn, text.to_string(), history);
            return;
        }

        match self.connection.send(turn, text, history, now) {
            SendOutcome::Sent => self.on_delivered(turn, now),
            SendOutcome::Deferred => debug!(%turn, "message deferred until connected"),
        }
    }

    fn send_voice(&mut self, audio: Vec<u8>, file_name: &str) {
        let Some(api) = self.api.clone() else {
            self.conversation
                .append_system_message("Voice input needs an API url in the config.");
            return;
        };

        let turn = self.begin_turn("");
        let history = self.conversation.history();
        let file_name = file_name.to_string();
        info!(%turn, size = audio.len(), "sending recording");
        self.spawn(async move {
            let result = api.send_speech(audio, &file_name, &history).await;
            TaskEvent::Reply {
                turn,
                speech: true,
                result,
            }
        });
    }

    fn spawn_text_request(&mut self, turn: TurnId, text: String, history: Vec<HistoryEntry>) {
        let Some(api) = self.api.clone() else {
            self.abort_turn(ChatError::Connection("no API url configured".to_string()));
            return;
        };
        let session_id = self.connection.session_token().map(str::to_string);
        self.spawn(async move {
            let result = api.send_text(&text, &history, session_id.as_deref()).await;
            TaskEvent::Reply {
                turn,
                speech: false,
                result,
            }
        });
    }

    fn spawn_health_check(&self) {
        let Some(api) = self.api.clone() else {
            return;
        };
        self.spawn(async move { TaskEvent::Health(api.health().await) });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = TaskEvent> + Send + 'static,
    {
        let tx = self.tasks.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    /// Close out the previous turn and start a new one
    fn begin_turn(&mut self, query: &str) -> TurnId {
        if self.conversation.in_flight() {
            let leftover = self.scheduler.finish();
            self.apply_fragments(leftover);
        }
        let (turn, finalized) = self.conversation.reset_for_new_turn();
        if let Some(message) = finalized {
            debug!(order = message.order, "kept partial reply of previous turn");
        }
        self.scheduler.reset(turn);
        self.placeholder.cancel();
        self.query = query.to_string();
        turn
    }

    fn on_delivered(&mut self, turn: TurnId, now: Instant) {
        if turn != self.conversation.turn() || !self.conversation.in_flight() {
            return;
        }
        self.scheduler.arm_watchdog(now);
        if self.config.pacing.placeholder {
            self.placeholder
                .arm(now, self.config.pacing.placeholder_delay(), turn);
        }
    }

    fn on_undeliverable(&mut self, turn: TurnId) {
        if self.api.is_some() && self.connection.is_errored() {
            info!(%turn, "falling back to the HTTP endpoint");
            let mut history = self.conversation.history();
            // The last entry is the message being resent
            history.pop();
            let text = self.query.clone();
            self.spawn_text_request(turn, text, history);
        } else {
            self.abort_turn(ChatError::Connection("message could not be delivered".to_string()));
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent, now: Instant) {
        match event {
            InboundEvent::Chunk { text, .. } => {
                if !self.conversation.in_flight() {
                    debug!("chunk outside of a turn");
                    return;
                }
                self.placeholder.cancel();
                let released = self.scheduler.ingest(Fragment::real(text, now), now);
                self.apply_fragments(released);
            }
            InboundEvent::Final {
                response,
                audio_url,
                ..
            } => {
                if !self.conversation.in_flight() {
                    debug!("final response outside of a turn");
                    return;
                }
                self.placeholder.cancel();
                let leftover = self.scheduler.finish();
                self.apply_fragments(leftover);
                if let Some(message) = self
                    .conversation
                    .finalize_streaming(Some(&response), audio_url)
                {
                    self.fetch_audio(&message);
                }
                info!(turn = %self.conversation.turn(), "response complete");
            }
            InboundEvent::Error { message } => {
                self.abort_turn(ChatError::Upstream(message));
            }
            InboundEvent::Other { .. } => {}
        }
    }

    fn handle_task(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Reply {
                turn,
                speech,
                result,
            } => self.on_reply(turn, speech, result),
            TaskEvent::Health(Ok(report)) => {
                info!(status = %report.status, "API health");
                self.api_health = Some(report.status);
            }
            TaskEvent::Health(Err(e)) => {
                warn!(error = %e, "API health check failed");
                self.api_health = Some("unreachable".to_string());
            }
            TaskEvent::Audio { order, result } => {
                let status = match result {
                    Ok(path) => AudioStatus::Ready(path),
                    Err(e) => {
                        warn!(order, error = %e, "audio fetch failed");
                        AudioStatus::Failed(e.to_string())
                    }
                };
                self.audio.insert(order, status);
            }
        }
    }

    fn on_reply(&mut self, turn: TurnId, speech: bool, result: ChatResult<RawReply>) {
        if turn != self.conversation.turn() || !self.conversation.in_flight() {
            debug!(%turn, "dropping reply for a finished turn");
            return;
        }

        let mut reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.abort_turn(e);
                return;
            }
        };

        if speech {
            if let Some(transcription) = reply.text.take().filter(|t| !t.is_empty()) {
                self.conversation.append_user_message(&transcription);
            }
        }

        match InboundEvent::from(reply) {
            InboundEvent::Final {
                response,
                audio_url,
                ..
            } => {
                if let Some(message) = self
                    .conversation
                    .finalize_streaming(Some(&response), audio_url)
                {
                    self.fetch_audio(&message);
                }
            }
            InboundEvent::Error { message } => self.abort_turn(ChatError::Upstream(message)),
            _ => self.abort_turn(ChatError::Protocol(
                "reply had neither a response nor an error".to_string(),
            )),
        }
    }

    fn apply_fragments(&mut self, fragments: Vec<Fragment>) {
        for fragment in fragments {
            if fragment.synthetic {
                self.conversation.begin_streaming(&fragment.text);
            } else {
                self.conversation.merge_fragment(&fragment.text);
            }
        }
    }

    fn finish_on_timeout(&mut self) {
        let leftover = self.scheduler.finish();
        self.apply_fragments(leftover);
        self.placeholder.cancel();
        match self.conversation.finalize_streaming(None, None) {
            Some(message) => {
                warn!(order = message.order, "no completion signal; keeping partial reply");
            }
            None => {
                let error = ChatError::Timeout(self.config.pacing.idle_timeout());
                warn!(%error, "turn timed out");
                self.conversation.append_system_message(&error.user_message());
            }
        }
    }

    /// End the current turn with an error, keeping real partial content
    fn abort_turn(&mut self, error: ChatError) {
        warn!(turn = %self.conversation.turn(), %error, "turn failed");
        let leftover = self.scheduler.finish();
        self.apply_fragments(leftover);
        self.placeholder.cancel();
        self.conversation.fail_turn();
        self.conversation.append_system_message(&error.user_message());
    }

    fn fetch_audio(&mut self, message: &Message) {
        let (Some(audio_url), Some(api), Some(dir)) =
            (message.audio_ref.clone(), self.api.clone(), self.audio_dir.clone())
        else {
            return;
        };
        let order = message.order;
        self.audio.insert(order, AudioStatus::Fetching);
        self.spawn(async move {
            let result = api.fetch_audio(&audio_url, &dir).await;
            TaskEvent::Audio { order, result }
        });
    }

    fn sync_connection_status(&mut self) {
        for change in self.connection.take_status_changes() {
            info!(status = change.label(), "connection status");
            self.last_status = Some(change);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// A controller running on its own task
pub struct ChatHandle {
    inputs: mpsc::UnboundedSender<UserInput>,
    view: watch::Receiver<ChatView>,
    task: JoinHandle<()>,
}

impl ChatHandle {
    pub fn spawn(controller: ChatController) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();
        let view = controller.subscribe();
        let task = tokio::spawn(controller.run(rx));
        Self { inputs, view, task }
    }

    /// False once the controller has stopped
    pub fn send(&self, input: UserInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    pub async fn shutdown(self) {
        drop(self.inputs);
        let _ = self.task.await;
    }
}
