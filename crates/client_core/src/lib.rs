use std::{sync::Arc, time::Duration};

use serde_json::Value;
use shared::{
    domain::{normalize_rotation, Axis, Source, SourceId, SourceStatus},
    error::CommandFailure,
    protocol::{Action, Command, PipelineConfig},
    scan::{Position, ScanConfig},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::info;

pub mod connection;
pub mod error;
pub mod queue;
pub mod router;
pub mod scan;
pub mod session;
pub mod settings;
pub mod state;
pub mod transport;

use error::{ControllerError, SettingsError};
use scan::ScanExecutor;
use session::{CommandSink, Session, SessionHandle};
use settings::ControllerSettings;
use state::{AppState, ScanPhase, SharedState};
use transport::{Connector, WebSocketConnector};

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Connected,
    Disconnected {
        reason: String,
        retry_in: Duration,
    },
    CommandSent {
        seq: u64,
        action: Action,
    },
    /// The connection dropped while this command awaited its reply.
    CommandLost {
        seq: u64,
        action: Action,
    },
    CommandTimedOut {
        seq: u64,
        action: Action,
    },
    CommandSucceeded {
        action: String,
        source_id: Option<SourceId>,
    },
    CommandFailed(CommandFailure),
    SourcesUpdated(Vec<Source>),
    SourceStatusChanged {
        source_id: SourceId,
        status: SourceStatus,
    },
    SelectionChanged(Option<SourceId>),
    ConfigReceived {
        source_id: Option<SourceId>,
        config: PipelineConfig,
    },
    HealthReceived(Value),
    MetricsReceived(Value),
    CounterUpdated(Value),
    PlatformChanged {
        rotation: f64,
        tilt: f64,
    },
    SystemStatusChanged(String),
    RemoteTaskChanged {
        running: bool,
        progress: u8,
    },
    ScanStateChanged {
        phase: ScanPhase,
        progress_pct: u8,
    },
    ScanStep {
        position: Position,
        total: usize,
        progress_pct: u8,
    },
    ProtocolError(String),
}

/// Front door for applications: one session, one scan executor and the
/// state they both publish into.
pub struct ControllerClient {
    session: SessionHandle,
    executor: ScanExecutor,
    state: SharedState,
    task: JoinHandle<()>,
}

impl ControllerClient {
    /// Connects over WebSocket to `settings.server_url`. Must be called
    /// from within a tokio runtime.
    pub fn connect(settings: ControllerSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self::with_connector(settings, Arc::new(WebSocketConnector)))
    }

    pub fn with_connector(settings: ControllerSettings, connector: Arc<dyn Connector>) -> Self {
        let state = AppState::shared();
        let (session, task) = Session::spawn(&settings, connector, state.clone());
        let executor = ScanExecutor::new(
            Arc::new(session.clone()),
            state.clone(),
            session.events(),
        );
        info!(url = %settings.server_url, "controller client started");
        Self {
            session,
            executor,
            state,
            task,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn executor(&self) -> &ScanExecutor {
        &self.executor
    }

    pub fn list_sources(&self) -> Result<(), ControllerError> {
        self.submit(Command::list_cameras())
    }

    pub fn start_source(&self, source_id: SourceId) -> Result<(), ControllerError> {
        self.submit(Command::start(source_id))
    }

    pub fn stop_source(&self, source_id: SourceId) -> Result<(), ControllerError> {
        self.submit(Command::stop(source_id))
    }

    pub fn get_config(&self, source_id: SourceId) -> Result<(), ControllerError> {
        self.submit(Command::get_config(source_id))
    }

    pub fn update_config(&self, source_id: SourceId, config: Value) -> Result<(), ControllerError> {
        self.submit(Command::update_config(source_id, config))
    }

    pub fn get_health(&self, source_id: SourceId) -> Result<(), ControllerError> {
        self.submit(Command::get_health(source_id))
    }

    pub fn get_metrics(&self, source_id: SourceId) -> Result<(), ControllerError> {
        self.submit(Command::get_metrics(source_id))
    }

    pub fn request_status(&self) -> Result<(), ControllerError> {
        self.submit(Command::get_status())
    }

    /// Changes the selected source; selecting a source also requests its config.
    pub fn select_source(&self, source_id: Option<SourceId>) -> Result<(), ControllerError> {
        Ok(self.session.select_source(source_id)?)
    }

    /// Absolute platform move. Accepts `[0, 360]`; 360 wraps to 0.
    pub async fn move_platform(&self, angle: f64) -> Result<(), ControllerError> {
        let angle = checked_angle(Axis::Platform, angle)?;
        self.manual_move(Axis::Platform, normalize_rotation(angle)).await
    }

    pub async fn move_tilt(&self, angle: f64) -> Result<(), ControllerError> {
        let angle = checked_angle(Axis::Tilt, angle)?;
        self.manual_move(Axis::Tilt, angle).await
    }

    /// Relative rotation from the last known pose; wraps around.
    pub async fn rotate_by(&self, delta: f64) -> Result<(), ControllerError> {
        if !delta.is_finite() {
            return Err(ControllerError::InvalidAngle {
                axis: Axis::Platform,
                value: delta,
            });
        }
        let current = self.state.read().await.pose.rotation;
        self.manual_move(Axis::Platform, normalize_rotation(current + delta))
            .await
    }

    /// Relative tilt from the last known pose; leaving `[0, 90]` is rejected.
    pub async fn tilt_by(&self, delta: f64) -> Result<(), ControllerError> {
        let current = self.state.read().await.pose.tilt;
        let target = checked_angle(Axis::Tilt, current + delta)?;
        self.manual_move(Axis::Tilt, target).await
    }

    pub async fn start_scan(&self, config: ScanConfig) -> Result<usize, ControllerError> {
        Ok(self.executor.start(config).await?)
    }

    pub async fn stop_scan(&self) -> Result<(), ControllerError> {
        Ok(self.executor.stop().await?)
    }

    pub async fn reset_position(&self) -> Result<(), ControllerError> {
        Ok(self.executor.reset().await?)
    }

    /// Closes the channel and waits for the session task to exit.
    pub async fn shutdown(self) {
        if self.session.shutdown().is_ok() {
            let _ = self.task.await;
        }
    }

    async fn manual_move(&self, axis: Axis, angle: f64) -> Result<(), ControllerError> {
        let mut state = self.state.write().await;
        if state.scan.is_active() {
            return Err(ControllerError::ManualControlLocked);
        }
        let command = match axis {
            Axis::Platform => Command::move_platform(angle),
            Axis::Tilt => Command::move_tilt(angle),
        };
        self.submit(command)?;
        match axis {
            Axis::Platform => state.pose.rotation = angle,
            Axis::Tilt => state.pose.tilt = angle,
        }
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<(), ControllerError> {
        Ok(self.session.submit(command)?)
    }
}

fn checked_angle(axis: Axis, value: f64) -> Result<f64, ControllerError> {
    if value.is_finite() && (0.0..=axis.max_angle()).contains(&value) {
        Ok(value)
    } else {
        Err(ControllerError::InvalidAngle { axis, value })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
