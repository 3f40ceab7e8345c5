//! Applies inbound messages to [`AppState`] and releases the command gate.

use shared::{
    domain::{normalize_rotation, Axis, SourceId, SourceStatus},
    error::CommandFailure,
    protocol::{Action, InboundKind, InboundMessage, PlatformStatus},
};
use tracing::{debug, trace};

use crate::{
    queue::{CommandQueue, QueuedCommand},
    settings::AckDiscipline,
    state::{AppState, CommandOutcome},
    ControllerEvent,
};

#[derive(Debug, Clone, Copy)]
pub struct MessageRouter {
    discipline: AckDiscipline,
}

impl MessageRouter {
    pub fn new(discipline: AckDiscipline) -> Self {
        Self { discipline }
    }

    pub fn discipline(&self) -> AckDiscipline {
        self.discipline
    }

    /// Routes one message. The gate is evaluated exactly once, before any
    /// dispatch rule runs, so discarded and failed messages release it too.
    pub fn route(
        &self,
        state: &mut AppState,
        queue: &mut CommandQueue,
        message: &InboundMessage,
    ) -> Vec<ControllerEvent> {
        let released = queue.acknowledge(message, self.discipline);
        if let Some(released) = &released {
            debug!(
                seq = released.seq,
                action = %released.command.action,
                reply = message.action().unwrap_or("<none>"),
                "router: command acknowledged"
            );
        }

        let mut events = Vec::new();

        if let InboundKind::SourceList(sources) = &message.kind {
            state.replace_sources(sources.clone());
            events.push(ControllerEvent::SourcesUpdated(sources.clone()));
            return events;
        }

        if let Some(source_id) = &message.source_id {
            if !state.is_selected(source_id) {
                route_unselected(state, source_id, message, &mut events);
                return events;
            }
        }

        if message.is_failure() {
            let failure = failure_from(message, released.as_ref());
            if failure.action == Action::Stop.as_str() {
                state.selected.clear();
            }
            state.selected.last_outcome = Some(CommandOutcome::Failed(failure.clone()));
            events.push(ControllerEvent::CommandFailed(failure));
            return events;
        }

        dispatch(state, message, &mut events);
        events
    }
}

/// Only start/stop results for other sources refresh the cached status.
fn route_unselected(
    state: &mut AppState,
    source_id: &SourceId,
    message: &InboundMessage,
    events: &mut Vec<ControllerEvent>,
) {
    let status = match message.kind {
        InboundKind::SourceStarted => SourceStatus::Running,
        InboundKind::SourceStopped => SourceStatus::Stopped,
        _ => {
            trace!(
                %source_id,
                action = message.action().unwrap_or("<none>"),
                "router: discarded message for unselected source"
            );
            return;
        }
    };
    if state.set_source_status(source_id, status) {
        events.push(ControllerEvent::SourceStatusChanged {
            source_id: source_id.clone(),
            status,
        });
    }
}

fn failure_from(message: &InboundMessage, released: Option<&QueuedCommand>) -> CommandFailure {
    let action = message
        .action
        .clone()
        .or_else(|| released.map(|queued| queued.command.action.to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    let source_id = message.source_id.clone().or_else(|| {
        released.and_then(|queued| queued.command.source_id.clone())
    });
    let error = message
        .error
        .clone()
        .unwrap_or_else(|| "unspecified error".to_string());
    CommandFailure::new(action, source_id, error)
}

fn dispatch(state: &mut AppState, message: &InboundMessage, events: &mut Vec<ControllerEvent>) {
    match &message.kind {
        InboundKind::SourceStarted | InboundKind::SourceStopped => {
            if let Some(source_id) = &message.source_id {
                let status = if matches!(message.kind, InboundKind::SourceStarted) {
                    SourceStatus::Running
                } else {
                    SourceStatus::Stopped
                };
                if state.set_source_status(source_id, status) {
                    events.push(ControllerEvent::SourceStatusChanged {
                        source_id: source_id.clone(),
                        status,
                    });
                }
            }
            record_success(state, message, events);
        }
        InboundKind::ConfigSnapshot(config) => {
            // Snapshots without a source_id are scoped by the source they describe.
            let target = message
                .source_id
                .clone()
                .or_else(|| config.source_key().map(SourceId::from));
            if let Some(target) = &target {
                if !state.is_selected(target) {
                    trace!(source_id = %target, "router: discarded config for unselected source");
                    return;
                }
            }
            state.selected.config = Some(config.clone());
            events.push(ControllerEvent::ConfigReceived {
                source_id: target,
                config: config.clone(),
            });
        }
        InboundKind::ConfigUpdated | InboundKind::CommandResult => {
            record_success(state, message, events);
        }
        InboundKind::Health(health) => {
            state.selected.health = Some(health.clone());
            events.push(ControllerEvent::HealthReceived(health.clone()));
        }
        InboundKind::Metrics(metrics) => {
            state.selected.metrics = Some(metrics.clone());
            events.push(ControllerEvent::MetricsReceived(metrics.clone()));
        }
        InboundKind::CounterUpdate(counters) => {
            state.selected.counters = Some(counters.clone());
            events.push(ControllerEvent::CounterUpdated(counters.clone()));
        }
        InboundKind::Status(status) => apply_status(state, status, events),
        InboundKind::PlatformMoved { angle } => {
            state.pose.rotation = normalize_rotation(*angle);
            events.push(platform_changed(state));
        }
        InboundKind::TiltMoved { angle } => {
            state.pose.tilt = angle.clamp(0.0, Axis::Tilt.max_angle());
            events.push(platform_changed(state));
        }
        InboundKind::TaskProgress { progress } => {
            state.remote_task.progress = clamp_percent(*progress);
            events.push(remote_task_changed(state));
        }
        InboundKind::TaskState { running } => {
            state.remote_task.running = *running;
            events.push(remote_task_changed(state));
        }
        InboundKind::SystemStatus { status } => {
            state.system_status = Some(status.clone());
            events.push(ControllerEvent::SystemStatusChanged(status.clone()));
        }
        InboundKind::Ready => trace!("router: ready"),
        InboundKind::Unrecognized => debug!(
            action = message.action().unwrap_or("<none>"),
            "router: unrecognized message"
        ),
        InboundKind::SourceList(_) | InboundKind::Failure => {}
    }
}

fn apply_status(state: &mut AppState, status: &PlatformStatus, events: &mut Vec<ControllerEvent>) {
    if status.platform.is_some() || status.tilt.is_some() {
        if let Some(rotation) = status.platform {
            state.pose.rotation = normalize_rotation(rotation);
        }
        if let Some(tilt) = status.tilt {
            state.pose.tilt = tilt.clamp(0.0, Axis::Tilt.max_angle());
        }
        events.push(platform_changed(state));
    }
    if let Some(task) = &status.task {
        if let Some(running) = task.running {
            state.remote_task.running = running;
        }
        if let Some(progress) = task.progress {
            state.remote_task.progress = clamp_percent(progress);
        }
        events.push(remote_task_changed(state));
    }
    if let Some(system_status) = &status.system_status {
        state.system_status = Some(system_status.clone());
        events.push(ControllerEvent::SystemStatusChanged(system_status.clone()));
    }
}

fn record_success(state: &mut AppState, message: &InboundMessage, events: &mut Vec<ControllerEvent>) {
    let action = message.action().unwrap_or_default().to_string();
    state.selected.last_outcome = Some(CommandOutcome::Succeeded {
        action: action.clone(),
    });
    events.push(ControllerEvent::CommandSucceeded {
        action,
        source_id: message.source_id.clone(),
    });
}

fn platform_changed(state: &AppState) -> ControllerEvent {
    ControllerEvent::PlatformChanged {
        rotation: state.pose.rotation,
        tilt: state.pose.tilt,
    }
}

fn remote_task_changed(state: &AppState) -> ControllerEvent {
    ControllerEvent::RemoteTaskChanged {
        running: state.remote_task.running,
        progress: state.remote_task.progress,
    }
}

fn clamp_percent(progress: f64) -> u8 {
    progress.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
