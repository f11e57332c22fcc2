//! Session state machine and configuration
//!
//! ```text
//! Closed --Open--> Opening --OpenSucceeded--> Idle
//!                  Opening --OpenFailed-----> Closed
//! Idle --IssueRequest--> AwaitingResponse --ResponseComplete|RetriesExhausted--> Idle
//! Idle --ConfirmableSent--> AwaitingConfirmation --Confirmed|ConfirmRetriesExhausted--> Idle
//! any --TransportClosed|Close--> Closed
//! ```
//!
//! [`transition`] is the single table both session actors consult; an event
//! the table does not list for the current state is an error rather than a
//! silent no-op.

use std::time::Duration;

use tokio::sync::watch;

use crate::constants::{
    APP_SEQ_MODULUS, DEFAULT_MASTER_ADDRESS, DEFAULT_MAX_FRAGMENT_SIZE,
    DEFAULT_OUTSTATION_ADDRESS, RESERVED_ADDRESS_START,
};
use crate::error::{Dnp3Error, Dnp3Result};
use crate::logging::FilterLevel;
use crate::transport::TransportSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opening,
    Idle,
    /// Master: a request is outstanding
    AwaitingResponse,
    /// Outstation: a confirmed unsolicited response is outstanding
    AwaitingConfirmation,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionState::Closed | SessionState::Opening)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Open,
    OpenSucceeded,
    OpenFailed,
    IssueRequest,
    /// Non-final fragment of a multi-fragment response
    ResponseFragment,
    ResponseComplete,
    /// Response with a sequence number that does not match
    ResponseMismatched,
    /// Timeout with retries left; the request was re-sent
    Retry,
    RetriesExhausted,
    UnsolicitedReceived,
    ConfirmableSent,
    Confirmed,
    /// Confirm timeout with retries left; the response was re-sent
    ConfirmRetry,
    ConfirmRetriesExhausted,
    TransportClosed,
    Close,
}

/// Next state for `event` in `state`
pub fn transition(state: SessionState, event: SessionEvent) -> Dnp3Result<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        (_, E::TransportClosed) | (_, E::Close) => S::Closed,

        (S::Closed, E::Open) => S::Opening,
        (S::Opening, E::OpenSucceeded) => S::Idle,
        (S::Opening, E::OpenFailed) => S::Closed,

        (S::Idle, E::IssueRequest) => S::AwaitingResponse,
        (S::AwaitingResponse, E::ResponseFragment)
        | (S::AwaitingResponse, E::ResponseMismatched)
        | (S::AwaitingResponse, E::Retry) => S::AwaitingResponse,
        (S::AwaitingResponse, E::ResponseComplete) | (S::AwaitingResponse, E::RetriesExhausted) => {
            S::Idle
        }

        (S::Idle, E::UnsolicitedReceived) => S::Idle,
        (S::AwaitingResponse, E::UnsolicitedReceived) => S::AwaitingResponse,

        (S::Idle, E::ConfirmableSent) => S::AwaitingConfirmation,
        (S::AwaitingConfirmation, E::ConfirmRetry) => S::AwaitingConfirmation,
        (S::AwaitingConfirmation, E::Confirmed)
        | (S::AwaitingConfirmation, E::ConfirmRetriesExhausted) => S::Idle,

        (state, event) => {
            return Err(Dnp3Error::invalid_state(format!(
                "{:?} is not valid in state {:?}",
                event, state
            )))
        }
    };
    Ok(next)
}

/// Current state plus a watch channel publishing every change
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
    tx: watch::Sender<SessionState>,
}

impl StateMachine {
    pub fn new(initial: SessionState) -> (Self, watch::Receiver<SessionState>) {
        let (tx, rx) = watch::channel(initial);
        (Self { state: initial, tx }, rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply `event`, publishing the new state if it changed
    pub fn apply(&mut self, event: SessionEvent) -> Dnp3Result<SessionState> {
        let next = transition(self.state, event)?;
        if next != self.state {
            tracing::trace!("Session {:?} --{:?}--> {:?}", self.state, event, next);
            self.state = next;
            self.tx.send_replace(next);
        }
        Ok(next)
    }
}

/// Application sequence number, modulo 16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(u8);

impl Sequence {
    pub fn new(value: u8) -> Self {
        Self(value % APP_SEQ_MODULUS)
    }

    #[inline]
    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn next(&self) -> Sequence {
        Sequence((self.0 + 1) % APP_SEQ_MODULUS)
    }

    /// Return the current value and advance
    pub fn increment(&mut self) -> u8 {
        let current = self.0;
        *self = self.next();
        current
    }
}

/// Settings shared by master and outstation sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportSettings,
    /// Diagnostic threshold at session construction
    pub filter_level: FilterLevel,
    /// Re-sends after the first attempt
    pub retry_count: u32,
    pub response_timeout_ms: u64,
    pub unsolicited_confirm_timeout_ms: u64,
    pub local_link_address: u16,
    pub remote_link_address: u16,
    pub max_fragment_size: usize,
}

impl SessionConfig {
    /// Defaults from the master's point of view
    pub fn new(transport: TransportSettings) -> Self {
        Self {
            transport,
            filter_level: FilterLevel::Info,
            retry_count: crate::DEFAULT_RETRY_COUNT,
            response_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            unsolicited_confirm_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            local_link_address: DEFAULT_MASTER_ADDRESS,
            remote_link_address: DEFAULT_OUTSTATION_ADDRESS,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }

    /// Defaults with the link addresses swapped for an outstation
    pub fn outstation(transport: TransportSettings) -> Self {
        Self {
            local_link_address: DEFAULT_OUTSTATION_ADDRESS,
            remote_link_address: DEFAULT_MASTER_ADDRESS,
            ..Self::new(transport)
        }
    }

    pub fn with_filter_level(mut self, level: FilterLevel) -> Self {
        self.filter_level = level;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.response_timeout_ms = timeout_ms;
        self
    }

    pub fn with_unsolicited_confirm_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.unsolicited_confirm_timeout_ms = timeout_ms;
        self
    }

    pub fn with_link_addresses(mut self, local: u16, remote: u16) -> Self {
        self.local_link_address = local;
        self.remote_link_address = remote;
        self
    }

    pub fn with_max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn unsolicited_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.unsolicited_confirm_timeout_ms)
    }

    pub fn validate(&self) -> Dnp3Result<()> {
        self.transport.validate()?;
        if self.response_timeout_ms == 0 || self.unsolicited_confirm_timeout_ms == 0 {
            return Err(Dnp3Error::configuration("timeouts must be non-zero"));
        }
        for address in [self.local_link_address, self.remote_link_address] {
            if address >= RESERVED_ADDRESS_START {
                return Err(Dnp3Error::configuration(format!(
                    "link address {} is reserved",
                    address
                )));
            }
        }
        if self.local_link_address == self.remote_link_address {
            return Err(Dnp3Error::configuration(
                "local and remote link addresses must differ",
            ));
        }
        // A fragment must hold at least a response header and one object header
        if self.max_fragment_size < 64 {
            return Err(Dnp3Error::configuration("max fragment size must be at least 64"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}
