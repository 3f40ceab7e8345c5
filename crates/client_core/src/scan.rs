//! Drives a planned scan through the shared command queue.
//!
//! The executor never waits for replies: each position enqueues one
//! platform move and one tilt move, then sleeps for the configured delay.
//! Stopping only clears a flag, which the loop checks between positions.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    protocol::Command,
    scan::{plan, Position, ScanConfig},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    error::ScanError,
    session::CommandSink,
    state::{PlatformPose, ScanPhase, SharedState},
    ControllerEvent,
};

#[derive(Clone)]
pub struct ScanExecutor {
    sink: Arc<dyn CommandSink>,
    state: SharedState,
    events: broadcast::Sender<ControllerEvent>,
}

impl ScanExecutor {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        state: SharedState,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            sink,
            state,
            events,
        }
    }

    /// Validates and plans `config`, queues `start_task` and spawns the
    /// loop. Returns the number of planned positions.
    pub async fn start(&self, config: ScanConfig) -> Result<usize, ScanError> {
        let (generation, positions) = {
            let mut state = self.state.write().await;
            if state.scan.is_active() {
                return Err(ScanError::AlreadyRunning);
            }
            config.validate()?;
            let positions = plan(&config);
            if positions.is_empty() {
                return Err(ScanError::NoPositions);
            }

            let task = &mut state.scan;
            task.generation += 1;
            task.phase = ScanPhase::Initializing;
            task.config = Some(config);
            task.positions = positions.clone();
            task.current_index = 0;
            task.running = true;
            task.progress_pct = 0;
            task.started_at = Some(Utc::now());
            task.finished_at = None;
            (task.generation, positions)
        };
        self.emit_phase(ScanPhase::Initializing, 0);

        if let Err(err) = self.sink.submit(Command::start_task(&config)) {
            let mut state = self.state.write().await;
            if state.scan.generation == generation {
                state.scan.running = false;
                state.scan.phase = ScanPhase::Idle;
            }
            return Err(err.into());
        }

        let total = positions.len();
        info!(
            total,
            vertical_angles = config.vertical_angles,
            horizontal_step = config.horizontal_step,
            mode = ?config.operation_mode,
            "scan: started"
        );
        let delay = Duration::from_secs_f64(config.movement_delay);
        tokio::spawn(self.clone().drive(generation, positions, delay));
        Ok(total)
    }

    /// Requests cancellation. The loop stops after its current delay.
    pub async fn stop(&self) -> Result<(), ScanError> {
        {
            let mut state = self.state.write().await;
            if !state.scan.is_active() || !state.scan.running {
                return Err(ScanError::NotRunning);
            }
            state.scan.running = false;
        }
        self.sink.submit(Command::stop_task())?;
        info!("scan: stop requested");
        Ok(())
    }

    /// Returns the platform to 0/0 and clears progress.
    pub async fn reset(&self) -> Result<(), ScanError> {
        {
            let state = self.state.read().await;
            if state.scan.is_active() {
                return Err(ScanError::ResetWhileRunning);
            }
        }
        self.sink.submit(Command::move_platform(0.0))?;
        self.sink.submit(Command::move_tilt(0.0))?;

        {
            let mut state = self.state.write().await;
            state.pose = PlatformPose::default();
            state.scan.phase = ScanPhase::Idle;
            state.scan.current_index = 0;
            state.scan.progress_pct = 0;
        }
        self.emit_phase(ScanPhase::Idle, 0);
        let _ = self.events.send(ControllerEvent::PlatformChanged {
            rotation: 0.0,
            tilt: 0.0,
        });
        Ok(())
    }

    async fn drive(self, generation: u64, positions: Vec<Position>, delay: Duration) {
        let total = positions.len();
        {
            let mut state = self.state.write().await;
            if state.scan.generation != generation {
                return;
            }
            state.scan.phase = ScanPhase::Running;
        }
        self.emit_phase(ScanPhase::Running, 0);

        for position in positions {
            {
                let state = self.state.read().await;
                if state.scan.generation != generation || !state.scan.running {
                    break;
                }
            }

            let submitted = self
                .sink
                .submit(Command::move_platform(position.rotation))
                .and_then(|()| self.sink.submit(Command::move_tilt(position.tilt)));
            if let Err(err) = submitted {
                warn!(%err, index = position.index, "scan: session gone; abandoning task");
                break;
            }

            let progress_pct = progress_pct(position.index, total);
            {
                let mut state = self.state.write().await;
                if state.scan.generation != generation {
                    return;
                }
                state.scan.current_index = position.index;
                state.scan.progress_pct = progress_pct;
                state.pose = PlatformPose {
                    rotation: position.rotation,
                    tilt: position.tilt,
                };
            }
            let _ = self.events.send(ControllerEvent::ScanStep {
                position,
                total,
                progress_pct,
            });

            tokio::time::sleep(delay).await;
        }

        let (phase, progress_pct) = {
            let mut state = self.state.write().await;
            if state.scan.generation != generation {
                return;
            }
            let task = &mut state.scan;
            let completed = task.running && task.current_index == total;
            task.phase = if completed {
                task.progress_pct = 100;
                ScanPhase::Completed
            } else {
                ScanPhase::Stopped
            };
            task.running = false;
            task.finished_at = Some(Utc::now());
            (task.phase, task.progress_pct)
        };
        info!(?phase, progress_pct, "scan: finished");
        self.emit_phase(phase, progress_pct);
    }

    fn emit_phase(&self, phase: ScanPhase, progress_pct: u8) {
        let _ = self.events.send(ControllerEvent::ScanStateChanged {
            phase,
            progress_pct,
        });
    }
}

fn progress_pct(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (index as f64 * 100.0 / total as f64).round() as u8
}

#[cfg(test)]
#[path = "tests/scan_tests.rs"]
mod tests;
