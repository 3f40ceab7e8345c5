use std::sync::Mutex;

use shared::{error::ScanConfigError, protocol::Action, scan::OperationMode};

use super::*;
use crate::{error::SessionError, state::AppState};

#[derive(Default)]
struct RecordingSink {
    commands: Mutex<Vec<Command>>,
    closed: bool,
}

impl RecordingSink {
    fn actions(&self) -> Vec<Action> {
        self.commands
            .lock()
            .expect("sink lock")
            .iter()
            .map(|command| command.action)
            .collect()
    }
}

impl CommandSink for RecordingSink {
    fn submit(&self, command: Command) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.commands.lock().expect("sink lock").push(command);
        Ok(())
    }
}

struct Fixture {
    sink: Arc<RecordingSink>,
    state: SharedState,
    executor: ScanExecutor,
    events: broadcast::Receiver<ControllerEvent>,
}

fn fixture() -> Fixture {
    fixture_with(RecordingSink::default())
}

fn fixture_with(sink: RecordingSink) -> Fixture {
    let sink = Arc::new(sink);
    let state = AppState::shared();
    let (events_tx, events) = broadcast::channel(256);
    let executor = ScanExecutor::new(sink.clone(), state.clone(), events_tx);
    Fixture {
        sink,
        state,
        executor,
        events,
    }
}

fn sixteen_positions() -> ScanConfig {
    ScanConfig {
        vertical_angles: 4,
        horizontal_step: 90,
        movement_delay: 1.0,
        operation_mode: OperationMode::Sequential,
    }
}

async fn wait_for_step(
    events: &mut broadcast::Receiver<ControllerEvent>,
    index: usize,
) -> (Position, u8) {
    loop {
        if let ControllerEvent::ScanStep {
            position,
            progress_pct,
            ..
        } = events.recv().await.expect("event stream open")
        {
            if position.index == index {
                return (position, progress_pct);
            }
        }
    }
}

async fn wait_for_finish(events: &mut broadcast::Receiver<ControllerEvent>) -> (ScanPhase, u8) {
    loop {
        if let ControllerEvent::ScanStateChanged {
            phase,
            progress_pct,
        } = events.recv().await.expect("event stream open")
        {
            if matches!(phase, ScanPhase::Completed | ScanPhase::Stopped) {
                return (phase, progress_pct);
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn sixteen_position_scan_reports_half_way_at_step_eight() {
    let mut fx = fixture();

    let total = fx
        .executor
        .start(sixteen_positions())
        .await
        .expect("scan accepted");
    assert_eq!(total, 16);

    let (position, progress) = wait_for_step(&mut fx.events, 8).await;
    assert_eq!(progress, 50);
    assert_eq!(position.rotation, 270.0);
    assert_eq!(position.tilt, 30.0);

    let (phase, progress) = wait_for_finish(&mut fx.events).await;
    assert_eq!(phase, ScanPhase::Completed);
    assert_eq!(progress, 100);

    let actions = fx.sink.actions();
    assert_eq!(actions.len(), 1 + 16 * 2);
    assert_eq!(actions[0], Action::StartTask);
    assert_eq!(&actions[1..3], &[Action::MovePlatform, Action::MoveTilt]);

    let state = fx.state.read().await;
    assert_eq!(state.scan.phase, ScanPhase::Completed);
    assert!(!state.scan.running);
    assert!(state.scan.finished_at.is_some());
    assert_eq!(state.pose.rotation, 270.0);
    assert_eq!(state.pose.tilt, 90.0);
}

#[tokio::test(start_paused = true)]
async fn stop_after_fifth_step_freezes_progress() {
    let mut fx = fixture();
    fx.executor
        .start(sixteen_positions())
        .await
        .expect("scan accepted");

    wait_for_step(&mut fx.events, 5).await;
    fx.executor.stop().await.expect("scan is running");

    let (phase, progress) = wait_for_finish(&mut fx.events).await;
    assert_eq!(phase, ScanPhase::Stopped);
    assert_eq!(progress, 31);

    let actions = fx.sink.actions();
    assert_eq!(actions.len(), 1 + 5 * 2 + 1);
    assert_eq!(actions.last(), Some(&Action::StopTask));

    let state = fx.state.read().await;
    assert_eq!(state.scan.current_index, 5);
    assert_eq!(state.scan.progress_pct, 31);
}

#[tokio::test(start_paused = true)]
async fn start_is_rejected_while_a_stop_is_pending() {
    let mut fx = fixture();
    fx.executor
        .start(sixteen_positions())
        .await
        .expect("scan accepted");
    wait_for_step(&mut fx.events, 1).await;

    assert_eq!(
        fx.executor.start(sixteen_positions()).await,
        Err(ScanError::AlreadyRunning)
    );
    fx.executor.stop().await.expect("scan is running");
    assert_eq!(
        fx.executor.start(sixteen_positions()).await,
        Err(ScanError::AlreadyRunning)
    );
    assert_eq!(fx.executor.stop().await, Err(ScanError::NotRunning));

    wait_for_finish(&mut fx.events).await;
    assert_eq!(
        fx.executor.start(sixteen_positions()).await,
        Ok(16)
    );
}

#[tokio::test]
async fn invalid_config_sends_nothing() {
    let fx = fixture();
    let config = ScanConfig {
        vertical_angles: 11,
        ..sixteen_positions()
    };

    assert_eq!(
        fx.executor.start(config).await,
        Err(ScanError::InvalidConfig(ScanConfigError::VerticalAngles(11)))
    );
    assert!(fx.sink.actions().is_empty());
    assert_eq!(fx.state.read().await.scan.phase, ScanPhase::Idle);
}

#[tokio::test]
async fn stop_without_a_task_is_rejected() {
    let fx = fixture();
    assert_eq!(fx.executor.stop().await, Err(ScanError::NotRunning));
    assert!(fx.sink.actions().is_empty());
}

#[tokio::test]
async fn start_fails_cleanly_when_the_session_is_gone() {
    let fx = fixture_with(RecordingSink {
        closed: true,
        ..RecordingSink::default()
    });

    assert_eq!(
        fx.executor.start(sixteen_positions()).await,
        Err(ScanError::Session(SessionError::Closed))
    );
    let state = fx.state.read().await;
    assert_eq!(state.scan.phase, ScanPhase::Idle);
    assert!(!state.scan.running);
}

#[tokio::test(start_paused = true)]
async fn reset_returns_platform_home_after_a_scan() {
    let mut fx = fixture();
    fx.executor
        .start(sixteen_positions())
        .await
        .expect("scan accepted");

    assert_eq!(
        fx.executor.reset().await,
        Err(ScanError::ResetWhileRunning)
    );
    wait_for_finish(&mut fx.events).await;

    fx.executor.reset().await.expect("reset allowed once finished");

    let state = fx.state.read().await;
    assert_eq!(state.scan.phase, ScanPhase::Idle);
    assert_eq!(state.scan.progress_pct, 0);
    assert_eq!(state.pose, PlatformPose::default());

    let commands = fx.sink.commands.lock().expect("sink lock");
    let tail: Vec<_> = commands[commands.len() - 2..].to_vec();
    assert_eq!(tail, vec![Command::move_platform(0.0), Command::move_tilt(0.0)]);
}

#[test]
fn progress_rounds_to_nearest_percent() {
    assert_eq!(progress_pct(8, 16), 50);
    assert_eq!(progress_pct(5, 16), 31);
    assert_eq!(progress_pct(1, 3), 33);
    assert_eq!(progress_pct(2, 3), 67);
    assert_eq!(progress_pct(0, 0), 0);
}
