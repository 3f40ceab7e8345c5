//! The session actor: one task owning the connection, the command queue
//! and the router. Every mutation goes through its select loop.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::SourceId,
    protocol::{Command, InboundMessage},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Backoff, ConnectionManager, ConnectionState, Lifecycle},
    error::SessionError,
    queue::CommandQueue,
    router::MessageRouter,
    settings::ControllerSettings,
    state::SharedState,
    transport::{ChannelEvent, Connector},
    ControllerEvent,
};

/// Where commands are submitted. The session handle is the production
/// sink; the scan executor only needs this much of it.
pub trait CommandSink: Send + Sync {
    fn submit(&self, command: Command) -> Result<(), SessionError>;
}

#[derive(Debug)]
enum SessionRequest {
    Enqueue(Command),
    SelectSource(Option<SourceId>),
    Shutdown,
}

#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<SessionRequest>,
    events: broadcast::Sender<ControllerEvent>,
    state: SharedState,
}

impl SessionHandle {
    pub fn select_source(&self, source_id: Option<SourceId>) -> Result<(), SessionError> {
        self.request(SessionRequest::SelectSource(source_id))
    }

    /// Asks the actor to close the channel and exit. Queued commands are dropped.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<ControllerEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    fn request(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.requests
            .send(request)
            .map_err(|_| SessionError::Closed)
    }
}

impl CommandSink for SessionHandle {
    fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.request(SessionRequest::Enqueue(command))
    }
}

pub struct Session {
    connection: ConnectionManager,
    queue: CommandQueue,
    router: MessageRouter,
    command_timeout: Duration,
    refresh_on_open: bool,
    state: SharedState,
    events: broadcast::Sender<ControllerEvent>,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
}

impl Session {
    /// Spawns the actor on the current runtime. The first connection
    /// attempt starts immediately.
    pub fn spawn(
        settings: &ControllerSettings,
        connector: Arc<dyn Connector>,
        state: SharedState,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let backoff = Backoff::new(settings.initial_retry_delay(), settings.max_retry_delay());

        let session = Self {
            connection: ConnectionManager::new(settings.server_url.clone(), connector, backoff)
                .with_connect_timeout(settings.connect_timeout()),
            queue: CommandQueue::new(),
            router: MessageRouter::new(settings.ack_discipline),
            command_timeout: settings.command_timeout(),
            refresh_on_open: settings.refresh_on_open,
            state: state.clone(),
            events: events.clone(),
            requests: requests_rx,
        };
        let handle = SessionHandle {
            requests: requests_tx,
            events,
            state,
        };
        (handle, tokio::spawn(session.run()))
    }

    async fn run(mut self) {
        let mut running = self.connect().await;
        while running {
            let reconnect_at = self.connection.reconnect_deadline();
            let reply_deadline = self.queue.reply_deadline(self.command_timeout);
            let channel_open = self.connection.is_open();

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(SessionRequest::Enqueue(command)) => self.enqueue(command).await,
                    Some(SessionRequest::SelectSource(source_id)) => {
                        self.select_source(source_id).await
                    }
                    Some(SessionRequest::Shutdown) | None => running = false,
                },
                event = self.connection.next_event(), if channel_open => {
                    self.on_channel_event(event).await
                }
                _ = sleep_until_opt(reconnect_at) => running = self.connect().await,
                _ = sleep_until_opt(reply_deadline) => self.on_reply_timeout().await,
            }
        }

        self.connection.close();
        self.sync_connection_state().await;
        info!(pending = self.queue.len(), "session: stopped");
    }

    /// One connection attempt. Requests keep being served while it is
    /// pending; returns `false` if shutdown was requested meanwhile.
    async fn connect(&mut self) -> bool {
        self.state.write().await.connection = ConnectionState::Connecting;
        let mut selections = Vec::new();
        let lifecycle = {
            let attempt = self.connection.open();
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    lifecycle = &mut attempt => break lifecycle,
                    request = self.requests.recv() => match request {
                        Some(SessionRequest::Enqueue(command)) => {
                            let seq = self.queue.enqueue(command);
                            debug!(seq, "session: command queued while connecting");
                        }
                        Some(SessionRequest::SelectSource(source_id)) => selections.push(source_id),
                        Some(SessionRequest::Shutdown) | None => {
                            info!("session: shutdown during connection attempt");
                            return false;
                        }
                    },
                }
            }
        };
        self.sync_connection_state().await;
        match lifecycle {
            Lifecycle::Opened => {
                self.emit(ControllerEvent::Connected);
                if self.refresh_on_open {
                    self.queue.enqueue(Command::list_cameras());
                    self.queue.enqueue(Command::get_status());
                }
                self.pump().await;
            }
            Lifecycle::Closed { reason, retry_in } => {
                self.emit(ControllerEvent::Disconnected { reason, retry_in });
            }
        }
        for source_id in selections {
            self.select_source(source_id).await;
        }
        true
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(text) => self.on_frame(&text).await,
            ChannelEvent::Closed => self.on_closed("closed by peer".to_string()).await,
            ChannelEvent::Error(reason) => self.on_closed(reason).await,
        }
    }

    /// Routes every element of the frame in order, then pumps once.
    async fn on_frame(&mut self, text: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            for decoded in InboundMessage::decode_frame(text) {
                match decoded {
                    Ok(message) => {
                        events.extend(self.router.route(&mut state, &mut self.queue, &message));
                    }
                    Err(err) => {
                        warn!(%err, "session: undecodable inbound message");
                        // An unreadable reply still ends the wait for one.
                        if let Some(released) = self.queue.release() {
                            debug!(seq = released.seq, "session: gate released by malformed reply");
                        }
                        events.push(ControllerEvent::ProtocolError(err.to_string()));
                    }
                }
            }
        }
        for event in events {
            self.emit(event);
        }
        self.pump().await;
    }

    async fn on_closed(&mut self, reason: String) {
        if let Some(lost) = self.queue.take_lost() {
            warn!(
                seq = lost.seq,
                action = %lost.command.action,
                "session: in-flight command lost with the connection"
            );
            self.emit(ControllerEvent::CommandLost {
                seq: lost.seq,
                action: lost.command.action,
            });
        }
        if let Lifecycle::Closed { reason, retry_in } = self.connection.handle_closed(reason) {
            self.sync_connection_state().await;
            self.emit(ControllerEvent::Disconnected { reason, retry_in });
        }
    }

    async fn on_reply_timeout(&mut self) {
        if let Some(expired) = self.queue.expire(Instant::now(), self.command_timeout) {
            warn!(
                seq = expired.seq,
                action = %expired.command.action,
                timeout_ms = self.command_timeout.as_millis() as u64,
                "session: no reply before deadline"
            );
            self.emit(ControllerEvent::CommandTimedOut {
                seq: expired.seq,
                action: expired.command.action,
            });
        }
        self.pump().await;
    }

    async fn enqueue(&mut self, command: Command) {
        let seq = self.queue.enqueue(command);
        debug!(seq, pending = self.queue.len(), "session: command queued");
        self.pump().await;
    }

    async fn select_source(&mut self, source_id: Option<SourceId>) {
        let changed = self.state.write().await.select_source(source_id.clone());
        if !changed {
            return;
        }
        info!(source_id = ?source_id.as_ref().map(SourceId::as_str), "session: source selected");
        self.emit(ControllerEvent::SelectionChanged(source_id.clone()));
        if let Some(source_id) = source_id {
            self.enqueue(Command::get_config(source_id)).await;
        }
    }

    /// Transmits the head of the queue if the gate allows it.
    async fn pump(&mut self) {
        while let Some(queued) = self.queue.next_to_send(self.connection.is_open()) {
            let frame = match queued.command.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(seq = queued.seq, %err, "session: dropping unencodable command");
                    self.queue.release();
                    continue;
                }
            };
            if self.connection.send(frame).is_err() {
                self.queue.requeue_unsent();
                self.on_closed("channel gone before transmit".to_string()).await;
                return;
            }
            debug!(seq = queued.seq, action = %queued.command.action, "session: command sent");
            self.emit(ControllerEvent::CommandSent {
                seq: queued.seq,
                action: queued.command.action,
            });
            return;
        }
    }

    async fn sync_connection_state(&self) {
        self.state.write().await.connection = self.connection.state();
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
