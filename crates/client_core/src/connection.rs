use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{info, warn};

use crate::transport::{Channel, ChannelEvent, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Smallest reconnection delay; a zero delay would never grow.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential reconnection delay: doubles after each failure up to `max`,
/// back to `initial` after a successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_RETRY_DELAY);
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay for the retry scheduled now. The following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Opened,
    Closed { reason: String, retry_in: Duration },
}

/// Owns at most one channel and the single pending reconnect timer.
pub struct ConnectionManager {
    url: String,
    connector: Arc<dyn Connector>,
    state: ConnectionState,
    backoff: Backoff,
    channel: Option<Channel>,
    reconnect_at: Option<Instant>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, backoff: Backoff) -> Self {
        Self {
            url: url.into(),
            connector,
            state: ConnectionState::Disconnected,
            backoff,
            channel: None,
            reconnect_at: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn retry_delay(&self) -> Duration {
        self.backoff.current()
    }

    /// Tears down any previous channel and attempts a fresh connection. A
    /// failed or timed-out attempt counts as a close. Dropping the returned
    /// future abandons the attempt.
    pub async fn open(&mut self) -> Lifecycle {
        self.reconnect_at = None;
        self.channel = None;
        self.state = ConnectionState::Connecting;

        let attempt = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url));
        match attempt.await {
            Err(_) => self.handle_closed(format!(
                "connect timed out after {} ms",
                self.connect_timeout.as_millis()
            )),
            Ok(Ok(channel)) => {
                self.channel = Some(channel);
                self.state = ConnectionState::Open;
                self.backoff.reset();
                info!(url = %self.url, "connection: open");
                Lifecycle::Opened
            }
            Ok(Err(err)) => self.handle_closed(format!("{err:#}")),
        }
    }

    /// Unplanned close or channel error. Schedules exactly one retry.
    pub fn handle_closed(&mut self, reason: String) -> Lifecycle {
        self.channel = None;
        self.state = ConnectionState::Disconnected;

        let retry_in = match self.reconnect_at {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => {
                let delay = self.backoff.next_delay();
                self.reconnect_at = Some(Instant::now() + delay);
                delay
            }
        };
        warn!(
            url = %self.url,
            %reason,
            retry_in_ms = retry_in.as_millis() as u64,
            "connection: closed; reconnect scheduled"
        );
        Lifecycle::Closed { reason, retry_in }
    }

    /// Planned shutdown: no reconnect is scheduled.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closing;
        self.reconnect_at = None;
        self.channel = None;
        self.state = ConnectionState::Disconnected;
        info!(url = %self.url, "connection: closed by client");
    }

    /// Hands a frame to the channel. Fails only when there is no live channel.
    pub fn send(&self, frame: String) -> Result<(), String> {
        if !self.is_open() {
            return Err(frame);
        }
        match &self.channel {
            Some(channel) => channel.outbound.send(frame).map_err(|err| err.0),
            None => Err(frame),
        }
    }

    /// Next inbound event; pends forever while there is no channel.
    pub async fn next_event(&mut self) -> ChannelEvent {
        match self.channel.as_mut() {
            Some(channel) => channel
                .inbound
                .recv()
                .await
                .unwrap_or(ChannelEvent::Closed),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
