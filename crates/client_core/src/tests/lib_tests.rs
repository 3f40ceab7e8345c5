use async_trait::async_trait;
use shared::scan::OperationMode;
use tokio::sync::mpsc;

use super::*;
use crate::{
    error::ScanError,
    transport::{Channel, ChannelEvent, ChannelPeer},
};

struct LoopbackConnector {
    peers: mpsc::UnboundedSender<ChannelPeer>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &str) -> anyhow::Result<Channel> {
        let (channel, peer) = Channel::pair();
        let _ = self.peers.send(peer);
        Ok(channel)
    }
}

async fn client() -> (ControllerClient, ChannelPeer) {
    let (peers_tx, mut peers) = mpsc::unbounded_channel();
    let settings = ControllerSettings {
        refresh_on_open: false,
        ..ControllerSettings::default()
    };
    let client = ControllerClient::with_connector(
        settings,
        Arc::new(LoopbackConnector { peers: peers_tx }),
    );
    let peer = peers.recv().await.expect("client connects");
    (client, peer)
}

async fn sent_command(peer: &mut ChannelPeer) -> Command {
    let frame = peer.sent.recv().await.expect("channel open");
    serde_json::from_str(&frame).expect("outbound frame is a command")
}

fn ready(peer: &ChannelPeer) {
    peer.deliver
        .send(ChannelEvent::Frame(r#"{"action":"ready"}"#.into()))
        .expect("session listening");
}

#[tokio::test]
async fn out_of_range_moves_send_nothing() {
    let (client, mut peer) = client().await;

    assert!(matches!(
        client.move_platform(360.5).await,
        Err(ControllerError::InvalidAngle {
            axis: Axis::Platform,
            ..
        })
    ));
    assert!(matches!(
        client.move_platform(-1.0).await,
        Err(ControllerError::InvalidAngle { .. })
    ));
    assert!(matches!(
        client.move_tilt(91.0).await,
        Err(ControllerError::InvalidAngle {
            axis: Axis::Tilt,
            ..
        })
    ));
    assert!(matches!(
        client.move_tilt(f64::NAN).await,
        Err(ControllerError::InvalidAngle { .. })
    ));

    client.request_status().expect("session running");
    assert_eq!(sent_command(&mut peer).await, Command::get_status());
}

#[tokio::test]
async fn full_turn_wraps_to_zero() {
    let (client, mut peer) = client().await;

    client.move_platform(360.0).await.expect("360 is accepted");

    assert_eq!(sent_command(&mut peer).await, Command::move_platform(0.0));
    assert_eq!(client.state().read().await.pose.rotation, 0.0);
}

#[tokio::test]
async fn relative_moves_follow_the_local_pose() {
    let (client, mut peer) = client().await;

    client.move_platform(350.0).await.expect("valid angle");
    assert_eq!(sent_command(&mut peer).await, Command::move_platform(350.0));
    ready(&peer);

    client.rotate_by(20.0).await.expect("rotation wraps");
    assert_eq!(sent_command(&mut peer).await, Command::move_platform(10.0));
    ready(&peer);

    client.tilt_by(45.0).await.expect("within range");
    assert_eq!(sent_command(&mut peer).await, Command::move_tilt(45.0));

    assert!(matches!(
        client.tilt_by(50.0).await,
        Err(ControllerError::InvalidAngle {
            axis: Axis::Tilt,
            ..
        })
    ));
    let state = client.state();
    let state = state.read().await;
    assert_eq!(state.pose.rotation, 10.0);
    assert_eq!(state.pose.tilt, 45.0);
}

#[tokio::test(start_paused = true)]
async fn manual_control_is_locked_during_a_scan() {
    let (client, mut peer) = client().await;
    let config = ScanConfig {
        vertical_angles: 2,
        horizontal_step: 90,
        movement_delay: 0.5,
        operation_mode: OperationMode::Alternate,
    };

    assert_eq!(client.start_scan(config).await.expect("scan accepted"), 8);
    assert_eq!(sent_command(&mut peer).await, Command::start_task(&config));

    assert!(matches!(
        client.move_platform(10.0).await,
        Err(ControllerError::ManualControlLocked)
    ));
    assert!(matches!(
        client.rotate_by(10.0).await,
        Err(ControllerError::ManualControlLocked)
    ));
    assert!(matches!(
        client.reset_position().await,
        Err(ControllerError::Scan(ScanError::ResetWhileRunning))
    ));

    client.stop_scan().await.expect("scan running");
}

#[tokio::test]
async fn shutdown_stops_the_session() {
    let (client, _peer) = client().await;
    let session = client.session().clone();

    client.shutdown().await;

    assert!(session.submit(Command::get_status()).is_err());
}
