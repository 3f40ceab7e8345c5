//! In-memory model of the remote service: camera pipelines plus the
//! rotating/tilting platform. Pure state transitions, no I/O.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use shared::{
    domain::{normalize_rotation, Axis, SourceId},
    protocol::{Action, Command, InboundEnvelope, ModelConfig, PipelineConfig},
    scan::{plan, ScanConfig},
};

const SYSTEM_IDLE: &str = "idle";
const SYSTEM_SCANNING: &str = "scanning";

/// Reply to one inbound frame, plus pushes for every connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: InboundEnvelope,
    pub pushes: Vec<InboundEnvelope>,
}

impl Outcome {
    fn reply(reply: InboundEnvelope) -> Self {
        Self {
            reply,
            pushes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimSource {
    pub config: PipelineConfig,
    pub running: bool,
    pub received: u64,
    pub processed: u64,
    pub counters: BTreeMap<String, u64>,
}

impl SimSource {
    fn new(source_key: &str) -> Self {
        Self {
            config: default_pipeline(source_key),
            running: false,
            received: 0,
            processed: 0,
            counters: BTreeMap::new(),
        }
    }

    fn health(&self) -> Value {
        json!({
            "running": self.running,
            "received": self.received,
            "processed": self.processed,
            "queue_size": self.received.saturating_sub(self.processed),
        })
    }

    fn metrics(&self) -> Value {
        json!({
            "avg_inference_ms": 8.0 + 4.0 * self.config.models.len() as f64,
            "counters": self.counters,
            "last_error": Value::Null,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct SimTask {
    running: bool,
    total: usize,
    visited: usize,
}

impl SimTask {
    fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.visited as f64 * 100.0 / self.total as f64).min(100.0)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    sources: BTreeMap<SourceId, SimSource>,
    platform: f64,
    tilt: f64,
    task: SimTask,
    system_status: String,
    ticks: u64,
}

impl DeviceState {
    pub fn with_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        let sources = sources
            .into_iter()
            .map(|id| {
                let id = id.into();
                let source = SimSource::new(id.as_str());
                (id, source)
            })
            .collect();
        Self {
            sources,
            platform: 0.0,
            tilt: 0.0,
            task: SimTask::default(),
            system_status: SYSTEM_IDLE.to_string(),
            ticks: 0,
        }
    }

    pub fn source(&self, source_id: &SourceId) -> Option<&SimSource> {
        self.sources.get(source_id)
    }

    pub fn pose(&self) -> (f64, f64) {
        (self.platform, self.tilt)
    }

    pub fn task_running(&self) -> bool {
        self.task.running
    }

    /// Handles one text frame. Every frame gets exactly one reply, under the
    /// command's own action name; state changes other clients should see go
    /// out as pushes.
    pub fn handle_frame(&mut self, text: &str) -> Outcome {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Outcome::reply(InboundEnvelope::bare_error("invalid JSON"));
        };
        let known_action = value
            .get("action")
            .cloned()
            .and_then(|action| serde_json::from_value::<Action>(action).ok());
        if known_action.is_none() {
            return Outcome::reply(InboundEnvelope::bare_error("unknown action"));
        }
        match serde_json::from_value::<Command>(value) {
            Ok(command) => self.handle_command(command),
            Err(err) => Outcome::reply(InboundEnvelope::bare_error(format!(
                "invalid command: {err}"
            ))),
        }
    }

    pub fn handle_command(&mut self, command: Command) -> Outcome {
        let Command {
            action,
            source_id,
            config,
            data,
        } = command;

        match action {
            Action::ListCameras => Outcome::reply(self.list_cameras()),
            Action::Start => Outcome::reply(self.start(source_id)),
            Action::Stop => Outcome::reply(self.stop(source_id)),
            Action::GetConfig => Outcome::reply(self.get_config(source_id)),
            Action::UpdateConfig => Outcome::reply(self.update_config(source_id, config)),
            Action::GetHealth => Outcome::reply(self.running_source_reply(
                "get_health",
                source_id,
                SimSource::health,
            )),
            Action::GetMetrics => Outcome::reply(self.running_source_reply(
                "get_metrics",
                source_id,
                SimSource::metrics,
            )),
            Action::MovePlatform => match angle(data.as_ref()) {
                Some(angle) => {
                    self.platform = normalize_rotation(angle);
                    Outcome::reply(
                        InboundEnvelope::reply("move_platform")
                            .with_data(json!({ "angle": self.platform })),
                    )
                }
                None => Outcome::reply(failure("move_platform", "missing angle")),
            },
            Action::MoveTilt => match angle(data.as_ref()) {
                Some(angle) => {
                    self.tilt = angle.clamp(0.0, Axis::Tilt.max_angle());
                    let reply = InboundEnvelope::reply("move_tilt")
                        .with_data(json!({ "angle": self.tilt }));
                    Outcome {
                        reply,
                        pushes: self.advance_task(),
                    }
                }
                None => Outcome::reply(failure("move_tilt", "missing angle")),
            },
            Action::StartTask => self.start_task(data),
            Action::StopTask => self.stop_task(),
            Action::GetStatus => Outcome::reply(self.status()),
        }
    }

    /// Periodic pushes for running sources: metrics and counter updates.
    pub fn tick(&mut self) -> Vec<InboundEnvelope> {
        self.ticks += 1;
        let ticks = self.ticks;
        let mut pushes = Vec::new();
        for (source_id, source) in self.sources.iter_mut().filter(|(_, s)| s.running) {
            let fps = u64::from(source.config.fps.unwrap_or(30));
            source.received += fps;
            source.processed += fps;
            *source.counters.entry("person".to_string()).or_default() = ticks % 5;

            pushes.push(
                InboundEnvelope::reply("counter_update")
                    .with_source(source_id.clone())
                    .with_data(json!(source.counters)),
            );
            pushes.push(
                InboundEnvelope::reply("metrics")
                    .with_source(source_id.clone())
                    .with_data(source.metrics()),
            );
        }
        pushes
    }

    fn list_cameras(&self) -> InboundEnvelope {
        let cameras: Vec<Value> = self
            .sources
            .iter()
            .map(|(id, source)| {
                json!({
                    "name": id,
                    "status": if source.running { "running" } else { "stopped" },
                    "clients": u32::from(source.running),
                })
            })
            .collect();
        InboundEnvelope::reply("list_cameras").with_data(Value::Array(cameras))
    }

    fn start(&mut self, source_id: Option<SourceId>) -> InboundEnvelope {
        match source_id {
            Some(id) if self.sources.contains_key(&id) => {
                if let Some(source) = self.sources.get_mut(&id) {
                    source.running = true;
                }
                InboundEnvelope::reply("start")
                    .with_success(true)
                    .with_source(id)
            }
            _ => failure("start", "unknown source_id"),
        }
    }

    fn stop(&mut self, source_id: Option<SourceId>) -> InboundEnvelope {
        let source = source_id
            .as_ref()
            .and_then(|id| self.sources.get_mut(id))
            .filter(|source| source.running);
        match (source, source_id) {
            (Some(source), Some(id)) => {
                source.running = false;
                InboundEnvelope::reply("stop")
                    .with_success(true)
                    .with_source(id)
            }
            _ => failure("stop", "not running"),
        }
    }

    fn get_config(&self, source_id: Option<SourceId>) -> InboundEnvelope {
        let Some((id, source)) = source_id
            .as_ref()
            .and_then(|id| self.sources.get_key_value(id))
        else {
            return failure("get_config", "unknown source_id");
        };
        match serde_json::to_value(&source.config) {
            Ok(data) => InboundEnvelope::reply("get_config")
                .with_source(id.clone())
                .with_data(data),
            Err(err) => failure("get_config", err.to_string()),
        }
    }

    fn update_config(&mut self, source_id: Option<SourceId>, patch: Option<Value>) -> InboundEnvelope {
        let (Some(id), Some(Value::Object(patch))) = (source_id, patch) else {
            return failure("update_config", "missing parameters");
        };
        let Some(source) = self.sources.get_mut(&id).filter(|source| source.running) else {
            return failure("update_config", "not running");
        };
        match merge_config(&source.config, patch) {
            Ok(config) => {
                source.config = config;
                InboundEnvelope::reply("update_config")
                    .with_success(true)
                    .with_source(id)
            }
            Err(err) => failure("update_config", err),
        }
    }

    fn running_source_reply(
        &self,
        action: &str,
        source_id: Option<SourceId>,
        payload: fn(&SimSource) -> Value,
    ) -> InboundEnvelope {
        match source_id
            .as_ref()
            .and_then(|id| self.sources.get_key_value(id))
            .filter(|(_, source)| source.running)
        {
            Some((id, source)) => InboundEnvelope::reply(action)
                .with_source(id.clone())
                .with_data(payload(source)),
            None => InboundEnvelope::reply(action).with_error("not running"),
        }
    }

    fn start_task(&mut self, data: Option<Value>) -> Outcome {
        let config = data
            .ok_or_else(|| "missing task configuration".to_string())
            .and_then(|data| {
                serde_json::from_value::<ScanConfig>(data).map_err(|err| err.to_string())
            })
            .and_then(|config| config.validate().map(|()| config).map_err(|err| err.to_string()));
        match config {
            Ok(config) => {
                self.task = SimTask {
                    running: true,
                    total: plan(&config).len(),
                    visited: 0,
                };
                self.system_status = SYSTEM_SCANNING.to_string();
                Outcome {
                    reply: succeeded("start_task"),
                    pushes: vec![task_state(true), system_status(&self.system_status)],
                }
            }
            Err(err) => Outcome::reply(failure("start_task", err)),
        }
    }

    fn stop_task(&mut self) -> Outcome {
        self.task.running = false;
        self.system_status = SYSTEM_IDLE.to_string();
        Outcome {
            reply: succeeded("stop_task"),
            pushes: vec![task_state(false), system_status(&self.system_status)],
        }
    }

    /// A tilt move completes one scan position.
    fn advance_task(&mut self) -> Vec<InboundEnvelope> {
        if !self.task.running {
            return Vec::new();
        }
        self.task.visited += 1;
        let mut pushes = vec![InboundEnvelope::reply("task_progress")
            .with_data(json!({ "progress": self.task.progress().round() }))];
        if self.task.visited >= self.task.total {
            self.task.running = false;
            self.system_status = SYSTEM_IDLE.to_string();
            pushes.push(task_state(false));
            pushes.push(system_status(&self.system_status));
        }
        pushes
    }

    fn status(&self) -> InboundEnvelope {
        InboundEnvelope::reply("get_status").with_data(json!({
            "platform": self.platform,
            "tilt": self.tilt,
            "task": {
                "running": self.task.running,
                "progress": self.task.progress().round(),
            },
            "systemStatus": self.system_status,
        }))
    }
}

fn failure(action: &str, error: impl Into<String>) -> InboundEnvelope {
    InboundEnvelope::reply(action)
        .with_success(false)
        .with_error(error)
}

fn succeeded(action: &str) -> InboundEnvelope {
    InboundEnvelope::reply(action).with_success(true)
}

fn task_state(running: bool) -> InboundEnvelope {
    InboundEnvelope::reply("task_state").with_data(json!({ "running": running }))
}

fn system_status(status: &str) -> InboundEnvelope {
    InboundEnvelope::reply("system_status").with_data(json!({ "status": status }))
}

fn angle(data: Option<&Value>) -> Option<f64> {
    match data?.get("angle")? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Shallow merge of `patch` over the serialized config; unknown keys are kept.
fn merge_config(current: &PipelineConfig, patch: Map<String, Value>) -> Result<PipelineConfig, String> {
    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(err) => return Err(err.to_string()),
    };
    merged.extend(patch);
    serde_json::from_value(Value::Object(merged)).map_err(|err| err.to_string())
}

fn default_pipeline(source_key: &str) -> PipelineConfig {
    PipelineConfig {
        source: Some(Value::String(source_key.to_string())),
        width: Some(640),
        height: Some(480),
        fps: Some(30),
        quality: Some(95),
        use_cuda: Some(true),
        metrics_enabled: Some(true),
        models: vec![ModelConfig {
            path: "yolo11n.pt".into(),
            draw: true,
            confidence: Some(0.5),
            iou: Some(0.45),
            ..ModelConfig::default()
        }],
        extra: Map::new(),
    }
}

#[cfg(test)]
#[path = "tests/device_tests.rs"]
mod tests;
