//! Duplex text channel to the remote service.
//!
//! A [`Connector`] opens a fresh [`Channel`] per attempt. The session never
//! touches the socket directly: outbound frames go into an unbounded sender,
//! inbound frames and lifecycle signals arrive on a receiver. Dropping the
//! channel closes the underlying connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::settings::validate_server_url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    Closed,
    Error(String),
}

#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Builds a channel together with the peer ends, for in-process links.
    pub fn pair() -> (Self, ChannelPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            ChannelPeer {
                sent: outbound_rx,
                deliver: inbound_tx,
            },
        )
    }
}

/// The far side of a [`Channel::pair`].
#[derive(Debug)]
pub struct ChannelPeer {
    pub sent: mpsc::UnboundedReceiver<String>,
    pub deliver: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Channel>;
}

pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Channel> {
        validate_server_url(url)?;
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (channel, peer) = Channel::pair();
        let ChannelPeer {
            sent: mut outbound,
            deliver,
        } = peer;

        let inbound = deliver.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame)).await {
                    let _ = inbound.send(ChannelEvent::Error(format!(
                        "websocket send failed: {err}"
                    )));
                    return;
                }
            }
            debug!("outbound channel dropped; closing websocket");
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => ChannelEvent::Frame(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => ChannelEvent::Frame(text),
                        Err(err) => {
                            warn!(%err, "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = deliver.send(ChannelEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        return;
                    }
                };
                if deliver.send(event).is_err() {
                    return;
                }
            }
            let _ = deliver.send(ChannelEvent::Closed);
        });

        Ok(channel)
    }
}
