//! Application state published by the core and read by any front end.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{Source, SourceId, SourceStatus},
    error::CommandFailure,
    protocol::PipelineConfig,
    scan::{Position, ScanConfig},
};
use tokio::sync::RwLock;

use crate::connection::ConnectionState;

pub type SharedState = Arc<RwLock<AppState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPhase {
    #[default]
    Idle,
    Initializing,
    Running,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct ScanTask {
    pub phase: ScanPhase,
    pub config: Option<ScanConfig>,
    pub positions: Vec<Position>,
    /// Number of positions already issued.
    pub current_index: usize,
    /// Cleared by a stop request; the loop observes it between positions.
    pub running: bool,
    pub progress_pct: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub(crate) generation: u64,
}

impl ScanTask {
    /// Initializing or Running, including a stop that has not been observed yet.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, ScanPhase::Initializing | ScanPhase::Running)
    }

    pub fn total(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlatformPose {
    pub rotation: f64,
    pub tilt: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded { action: String },
    Failed(CommandFailure),
}

/// Cached projections for the selected source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceProjection {
    pub config: Option<PipelineConfig>,
    pub health: Option<Value>,
    pub metrics: Option<Value>,
    pub counters: Option<Value>,
    pub last_outcome: Option<CommandOutcome>,
}

impl SourceProjection {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RemoteTask {
    pub running: bool,
    pub progress: u8,
}

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub connection: ConnectionState,
    pub sources: Vec<Source>,
    pub selected_source_id: Option<SourceId>,
    pub selected: SourceProjection,
    pub pose: PlatformPose,
    pub system_status: Option<String>,
    pub remote_task: RemoteTask,
    pub scan: ScanTask,
}

impl AppState {
    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn source(&self, source_id: &SourceId) -> Option<&Source> {
        self.sources.iter().find(|source| &source.id == source_id)
    }

    pub fn is_selected(&self, source_id: &SourceId) -> bool {
        self.selected_source_id.as_ref() == Some(source_id)
    }

    pub fn replace_sources(&mut self, sources: Vec<Source>) {
        self.sources = sources;
    }

    /// Returns true when the cached status changed.
    pub fn set_source_status(&mut self, source_id: &SourceId, status: SourceStatus) -> bool {
        match self
            .sources
            .iter_mut()
            .find(|source| &source.id == source_id)
        {
            Some(source) if source.status == status => false,
            Some(source) => {
                source.status = status;
                true
            }
            None => {
                self.sources.push(Source::new(source_id.clone(), status));
                true
            }
        }
    }

    /// Returns true when the selection changed; projections of the previous
    /// source are dropped.
    pub fn select_source(&mut self, source_id: Option<SourceId>) -> bool {
        if self.selected_source_id == source_id {
            return false;
        }
        self.selected_source_id = source_id;
        self.selected.clear();
        true
    }
}
