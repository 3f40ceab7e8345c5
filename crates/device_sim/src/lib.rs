use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use shared::protocol::InboundEnvelope;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
};
use tracing::{debug, info, warn};

pub mod config;
pub mod device;

use device::{DeviceState, Outcome};

pub struct SimState {
    device: Mutex<DeviceState>,
    pushes: broadcast::Sender<String>,
}

impl SimState {
    pub fn new(device: DeviceState) -> Arc<Self> {
        let (pushes, _) = broadcast::channel(256);
        Arc::new(Self {
            device: Mutex::new(device),
            pushes,
        })
    }

    /// Applies one client frame to the device.
    pub async fn handle_frame(&self, text: &str) -> Outcome {
        self.device.lock().await.handle_frame(text)
    }

    pub fn publish(&self, pushes: &[InboundEnvelope]) {
        for push in pushes {
            self.broadcast(push);
        }
    }

    pub async fn tick(&self) {
        let pushes = self.device.lock().await.tick();
        self.publish(&pushes);
    }

    pub async fn with_device<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&*self.device.lock().await)
    }

    fn broadcast(&self, envelope: &InboundEnvelope) {
        if let Some(text) = encode(envelope) {
            let _ = self.pushes.send(text);
        }
    }
}

fn encode(envelope: &InboundEnvelope) -> Option<String> {
    match serde_json::to_string(envelope) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(%err, "failed to encode outbound message");
            None
        }
    }
}

pub fn build_router(state: Arc<SimState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<SimState>) -> anyhow::Result<()> {
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Pushes metrics and counters for running sources every `interval`.
pub async fn run_push_loop(state: Arc<SimState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.tick().await;
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SimState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<SimState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();
    let mut pushes = state.pushes.subscribe();
    info!("controller connected");

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                biased;
                Some(text) = direct_rx.recv() => text,
                push = pushes.recv() => match push {
                    Ok(text) => text,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        debug!(frame = %text, "received frame");
        let outcome = state.handle_frame(&text).await;
        // The direct reply is queued ahead of any push it caused.
        if let Some(reply) = encode(&outcome.reply) {
            if direct_tx.send(reply).is_err() {
                break;
            }
        }
        state.publish(&outcome.pushes);
    }

    send_task.abort();
    info!("controller disconnected");
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
