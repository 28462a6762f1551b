//! Connection lifecycle: connect, backoff, keepalive, deferred sends.
//!
//! `ConnectionManager` is a plain state machine. Link events come in through
//! `handle_link`, timers are driven by `poll`, and every status transition is
//! queued for the caller to drain with `take_status_changes`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::protocol::{parse_inbound, HistoryEntry, InboundEvent, OutboundEnvelope};
use crate::state::TurnId;
use crate::timer::{earliest, TimerSlot};
use crate::transport::{Epoch, LinkEvent, LinkHandle, TaggedLinkEvent, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed(String),
    Errored,
}

/// Reported once per transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Connecting { attempt: u32 },
    Connected,
    /// `retry_in` is set when a reconnect has been scheduled
    Disconnected { retry_in: Option<Duration>, attempt: u32 },
    Error(String),
}

impl StatusChange {
    pub fn label(&self) -> &'static str {
        match self {
            StatusChange::Connecting { .. } => "connecting",
            StatusChange::Connected => "connected",
            StatusChange::Disconnected { .. } => "disconnected",
            StatusChange::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Queued until the link opens
    Deferred,
}

/// Deferred sends resolved by a `poll`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConnectionPoll {
    pub delivered: Vec<TurnId>,
    pub undeliverable: Vec<TurnId>,
}

#[derive(Debug, Clone)]
struct PendingSend {
    turn: TurnId,
    text: String,
    history: Vec<HistoryEntry>,
    retries_left: u32,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TaggedLinkEvent>,
    state: ConnectionState,
    attempt_count: u32,
    session_token: Option<String>,
    epoch: Epoch,
    link: Option<LinkHandle>,
    manual_close: bool,
    statuses: Vec<StatusChange>,
    pending: VecDeque<PendingSend>,
    reconnect: TimerSlot<Epoch>,
    keepalive: TimerSlot<Epoch>,
    send_retry: TimerSlot<()>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            state: ConnectionState::Idle,
            attempt_count: 0,
            session_token: None,
            epoch: Epoch::default(),
            link: None,
            manual_close: false,
            statuses: Vec::new(),
            pending: VecDeque::new(),
            reconnect: TimerSlot::new(),
            keepalive: TimerSlot::new(),
            send_retry: TimerSlot::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_errored(&self) -> bool {
        self.state == ConnectionState::Errored
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Epoch of the most recent link; events tagged otherwise are ignored
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    /// When the scheduled reconnect fires, if one is scheduled
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect.deadline()
    }

    pub fn take_status_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.statuses)
    }

    /// Open a new link unless one is already open or opening.
    ///
    /// Does not reset the attempt counter; only a successful open does.
    pub fn connect(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!(state = ?self.state, "connect ignored");
            return;
        }

        self.manual_close = false;
        self.reconnect.cancel();
        self.epoch = self.epoch.next();
        self.state = ConnectionState::Connecting;
        self.statuses.push(StatusChange::Connecting {
            attempt: self.attempt_count,
        });
        info!(url = %self.config.url, attempt = self.attempt_count, epoch = self.epoch.0, "connecting");

        self.link = Some(
            self.transport
                .open(&self.config.url, self.epoch, self.events.clone()),
        );
    }

    /// Close the link on purpose. No reconnect follows. Returns the turns
    /// whose deferred sends were dropped.
    pub fn disconnect(&mut self) -> Vec<TurnId> {
        self.manual_close = true;
        self.reconnect.cancel();
        self.keepalive.cancel();
        self.send_retry.cancel();
        let dropped = self.pending.drain(..).map(|p| p.turn).collect();

        let live = matches!(self.state, ConnectionState::Connecting | ConnectionState::Open);
        if let (true, Some(link)) = (live, self.link.as_ref()) {
            info!("closing connection");
            link.close();
            self.state = ConnectionState::Closing;
            return dropped;
        }

        self.link = None;
        if !matches!(self.state, ConnectionState::Closed(_) | ConnectionState::Idle) {
            self.state = ConnectionState::Closed("closed by client".to_string());
            self.statuses.push(StatusChange::Disconnected {
                retry_in: None,
                attempt: self.attempt_count,
            });
        }
        dropped
    }

    /// Send a user message, or queue it and start connecting.
    pub fn send(
        &mut self,
        turn: TurnId,
        text: &str,
        history: Vec<HistoryEntry>,
        now: Instant,
    ) -> SendOutcome {
        let pending = PendingSend {
            turn,
            text: text.to_string(),
            history,
            retries_left: self.config.send_retry_limit,
        };

        if self.is_open() && self.transmit(&pending) {
            return SendOutcome::Sent;
        }

        warn!(%turn, state = ?self.state, "not connected; deferring send");
        self.pending.push_back(pending);
        if !self.reconnect.is_armed() {
            self.connect();
        }
        if !self.send_retry.is_armed() {
            self.send_retry.arm(now, self.config.send_retry_delay(), ());
        }
        SendOutcome::Deferred
    }

    /// Apply one event from a link. Returns the decoded server event, if any.
    pub fn handle_link(&mut self, tagged: TaggedLinkEvent, now: Instant) -> Option<InboundEvent> {
        if tagged.epoch != self.epoch {
            debug!(epoch = tagged.epoch.0, current = self.epoch.0, "ignoring event from stale link");
            return None;
        }

        match tagged.event {
            LinkEvent::Opened => {
                if self.manual_close {
                    // Closed while the handshake was still running
                    if let Some(link) = &self.link {
                        link.close();
                    }
                    return None;
                }
                self.state = ConnectionState::Open;
                self.attempt_count = 0;
                self.statuses.push(StatusChange::Connected);
                if let Some(every) = self.config.keepalive() {
                    self.keepalive.arm(now, every, self.epoch);
                }
                None
            }
            LinkEvent::Frame(frame) => match parse_inbound(&frame) {
                Ok(event) => {
                    if let Some(id) = event.session_id() {
                        self.remember_session(id);
                    }
                    Some(event)
                }
                Err(e) => {
                    warn!(error = %e, "dropping inbound frame");
                    None
                }
            },
            LinkEvent::Error(message) => {
                warn!(%message, "link error");
                self.statuses.push(StatusChange::Error(message));
                None
            }
            LinkEvent::Closed { clean, reason } => {
                self.on_closed(clean, reason, now);
                None
            }
        }
    }

    /// Fire due timers.
    pub fn poll(&mut self, now: Instant) -> ConnectionPoll {
        let mut result = ConnectionPoll::default();

        if self.reconnect.fire_if_current(now, self.epoch) {
            info!(attempt = self.attempt_count, "reconnecting");
            self.connect();
        }

        if self.keepalive.fire_if_current(now, self.epoch) && self.is_open() {
            if let Some(every) = self.config.keepalive() {
                self.ping();
                self.keepalive.arm(now, every, self.epoch);
            }
        }

        if self.send_retry.take_expired(now).is_some() {
            self.retry_pending(now, &mut result);
        }

        result
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.reconnect.deadline(),
            self.keepalive.deadline(),
            self.send_retry.deadline(),
        ])
    }

    fn on_closed(&mut self, clean: bool, reason: String, now: Instant) {
        self.link = None;
        self.keepalive.cancel();

        if self.manual_close {
            info!(%reason, "connection closed");
            self.state = ConnectionState::Closed(reason);
            self.statuses.push(StatusChange::Disconnected {
                retry_in: None,
                attempt: self.attempt_count,
            });
            return;
        }

        if clean {
            info!(%reason, "connection closed cleanly");
            self.state = ConnectionState::Closed(reason);
            self.statuses.push(StatusChange::Disconnected {
                retry_in: None,
                attempt: self.attempt_count,
            });
        } else if self.attempt_count < self.config.max_attempts {
            self.attempt_count += 1;
            let delay = self.config.backoff_delay(self.attempt_count);
            warn!(
                %reason,
                attempt = self.attempt_count,
                max = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "connection lost; scheduling reconnect"
            );
            self.state = ConnectionState::Closed(reason);
            self.reconnect.arm(now, delay, self.epoch);
            self.statuses.push(StatusChange::Disconnected {
                retry_in: Some(delay),
                attempt: self.attempt_count,
            });
        } else {
            warn!(%reason, attempts = self.attempt_count, "giving up on reconnecting");
            self.state = ConnectionState::Errored;
            self.statuses.push(StatusChange::Disconnected {
                retry_in: None,
                attempt: self.attempt_count,
            });
            self.statuses.push(StatusChange::Error(format!(
                "Unable to connect after {} attempts",
                self.config.max_attempts
            )));
        }
    }

    fn retry_pending(&mut self, now: Instant, result: &mut ConnectionPoll) {
        if self.is_open() {
            while let Some(pending) = self.pending.pop_front() {
                if self.transmit(&pending) {
                    info!(turn = %pending.turn, "deferred message sent");
                    result.delivered.push(pending.turn);
                } else {
                    self.pending.push_front(pending);
                    break;
                }
            }
        }
        if self.pending.is_empty() {
            return;
        }

        if self.is_errored() {
            warn!(count = self.pending.len(), "connection failed; dropping deferred messages");
            result
                .undeliverable
                .extend(self.pending.drain(..).map(|p| p.turn));
            return;
        }

        let mut kept = VecDeque::with_capacity(self.pending.len());
        for mut pending in self.pending.drain(..) {
            if pending.retries_left == 0 {
                warn!(turn = %pending.turn, "giving up on deferred message");
                result.undeliverable.push(pending.turn);
            } else {
                pending.retries_left -= 1;
                kept.push_back(pending);
            }
        }
        self.pending = kept;

        if !self.pending.is_empty() {
            if !self.reconnect.is_armed() {
                self.connect();
            }
            self.send_retry.arm(now, self.config.send_retry_delay(), ());
        }
    }

    fn transmit(&self, pending: &PendingSend) -> bool {
        let envelope =
            OutboundEnvelope::send_message(&pending.text, self.session_token(), &pending.history);
        self.send_envelope(&envelope)
    }

    fn ping(&self) {
        debug!("keepalive ping");
        self.send_envelope(&OutboundEnvelope::ping());
    }

    fn send_envelope(&self, envelope: &OutboundEnvelope) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match envelope.to_json() {
            Ok(frame) => link.send(frame),
            Err(e) => {
                warn!(error = %e, "could not encode envelope");
                false
            }
        }
    }

    // First non-empty id wins
    fn remember_session(&mut self, id: &str) {
        if self.session_token.is_none() && !id.is_empty() {
            info!(session_id = %id, "session established");
            self.session_token = Some(id.to_string());
        }
    }
}
