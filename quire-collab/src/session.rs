//! Connection lifecycle as an explicit state machine.
//!
//! ```text
//!            Connect              ServerAck
//!   Idle ─────────────► Connecting ─────────► Connected ──┐
//!    ▲                   ▲    │ failure          │ failure │ SyncComplete
//!    │ Shutdown          │    ▼                  ▼         │ (synced = true)
//!    │           timer   Disconnected ◄──────────┘ ◄───────┘
//!    │                        │ retry_count ≥ max_retries, or 4401
//!    │                        ▼
//!    └──────────────────── Failed  (terminal until Restart)
//! ```
//!
//! [`TransportSession::handle`] is pure: it updates the status and returns
//! the effects a driver has to execute (open/close the socket, arm or
//! cancel the single timer). No I/O happens here.

use std::fmt;
use std::time::Duration;

/// Close codes that mean the credential was rejected.
pub fn is_unauthorized(code: u16) -> bool {
    code == crate::protocol::CLOSE_UNAUTHORIZED || code == 401
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Retry and timeout knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How long one connection attempt may take before counting as failed.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// The relay finished replaying its backlog on this connection.
    pub synced: bool,
}

impl SessionStatus {
    pub fn editing_enabled(&self) -> bool {
        self.state == ConnectionState::Connected && self.synced
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            last_error: None,
            synced: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    ServerAck,
    SyncComplete,
    ServerClose { code: u16, reason: String },
    NetworkError(String),
    RetryTimerFired,
    Restart,
    Shutdown,
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    OpenConnection { attempt: u32 },
    CloseConnection,
    /// Arm the session timer; fires `RetryTimerFired`. Replaces any armed timer.
    ScheduleRetry(Duration),
    CancelRetry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effects: Vec<SessionEffect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    RetryLimitExceeded { attempts: u32, last: String },
    Unauthorized(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryLimitExceeded { attempts, last } => {
                write!(f, "retry limit exceeded after {attempts} attempts: {last}")
            }
            Self::Unauthorized(reason) => write!(f, "unauthorized: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// The transport session state machine.
#[derive(Debug, Clone)]
pub struct TransportSession {
    config: SessionConfig,
    status: SessionStatus,
    failure: Option<SessionError>,
}

impl TransportSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            status: SessionStatus::default(),
            failure: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state
    }

    pub fn editing_enabled(&self) -> bool {
        self.status.editing_enabled()
    }

    /// Set when the session is `Failed`.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    /// Delay before retrying after the `attempt`-th consecutive failure.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay)
    }

    /// Feed one event through the transition table.
    pub fn handle(&mut self, event: SessionEvent) -> Transition {
        use ConnectionState::*;

        let from = self.status.state;
        let mut effects = Vec::new();

        match (from, event) {
            (Idle, SessionEvent::Shutdown) => {}
            (_, SessionEvent::Shutdown) => {
                effects.push(SessionEffect::CancelRetry);
                if matches!(from, Connecting | Connected) {
                    effects.push(SessionEffect::CloseConnection);
                }
                self.status = SessionStatus::default();
                self.failure = None;
            }

            (_, SessionEvent::Restart) => {
                effects.push(SessionEffect::CancelRetry);
                if matches!(from, Connecting | Connected) {
                    effects.push(SessionEffect::CloseConnection);
                }
                self.status = SessionStatus::default();
                self.failure = None;
                self.begin_attempt(&mut effects);
            }

            (Idle, SessionEvent::Connect) => self.begin_attempt(&mut effects),
            (Disconnected, SessionEvent::Connect) => {
                effects.push(SessionEffect::CancelRetry);
                self.begin_attempt(&mut effects);
            }

            (Connecting, SessionEvent::ServerAck) => {
                effects.push(SessionEffect::CancelRetry);
                self.status.state = Connected;
                self.status.retry_count = 0;
                self.status.last_error = None;
                self.status.synced = false;
            }

            (Connected, SessionEvent::SyncComplete) => self.status.synced = true,

            (Connecting | Connected, SessionEvent::ServerClose { code, reason }) => {
                if is_unauthorized(code) {
                    effects.push(SessionEffect::CancelRetry);
                    effects.push(SessionEffect::CloseConnection);
                    self.fail(SessionError::Unauthorized(reason));
                } else {
                    self.connection_lost(format!("closed by server ({code}): {reason}"), &mut effects);
                }
            }
            (Connecting | Connected, SessionEvent::NetworkError(error)) => {
                self.connection_lost(error, &mut effects);
            }
            (Connecting, SessionEvent::RetryTimerFired) => {
                let timeout = self.config.connect_timeout;
                self.connection_lost(format!("connect timed out after {timeout:?}"), &mut effects);
            }
            (Disconnected, SessionEvent::RetryTimerFired) => self.begin_attempt(&mut effects),

            (state, event) => {
                log::trace!("Session ignored {event:?} in state {state}");
            }
        }

        let to = self.status.state;
        if from != to {
            log::debug!("Session {from} -> {to} (retry {})", self.status.retry_count);
        }
        Transition { from, to, effects }
    }

    fn begin_attempt(&mut self, effects: &mut Vec<SessionEffect>) {
        self.status.retry_count += 1;
        self.status.synced = false;
        if self.status.retry_count > self.config.max_retries {
            let last = self.status.last_error.clone().unwrap_or_default();
            self.fail(SessionError::RetryLimitExceeded {
                attempts: self.status.retry_count - 1,
                last,
            });
            return;
        }
        self.status.state = ConnectionState::Connecting;
        effects.push(SessionEffect::OpenConnection {
            attempt: self.status.retry_count,
        });
        effects.push(SessionEffect::ScheduleRetry(self.config.connect_timeout));
    }

    fn connection_lost(&mut self, error: String, effects: &mut Vec<SessionEffect>) {
        log::warn!("Connection lost: {error}");
        effects.push(SessionEffect::CloseConnection);
        self.status.synced = false;

        if self.status.retry_count >= self.config.max_retries {
            effects.push(SessionEffect::CancelRetry);
            self.fail(SessionError::RetryLimitExceeded {
                attempts: self.status.retry_count,
                last: error,
            });
            return;
        }

        let delay = self.backoff_delay(self.status.retry_count);
        self.status.state = ConnectionState::Disconnected;
        self.status.last_error = Some(error);
        effects.push(SessionEffect::ScheduleRetry(delay));
    }

    fn fail(&mut self, error: SessionError) {
        log::error!("Session failed: {error}");
        self.status.state = ConnectionState::Failed;
        self.status.synced = false;
        self.status.last_error = Some(error.to_string());
        self.failure = Some(error);
    }
}

impl Default for TransportSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
