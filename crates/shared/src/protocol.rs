use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    domain::{Source, SourceId},
    error::ProtocolError,
    scan::ScanConfig,
};

/// Inbound action the service may send to release any outstanding command.
pub const READY_ACTION: &str = "ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ListCameras,
    Start,
    Stop,
    GetConfig,
    GetHealth,
    GetMetrics,
    UpdateConfig,
    MovePlatform,
    MoveTilt,
    StartTask,
    StopTask,
    GetStatus,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ListCameras => "list_cameras",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetConfig => "get_config",
            Self::GetHealth => "get_health",
            Self::GetMetrics => "get_metrics",
            Self::UpdateConfig => "update_config",
            Self::MovePlatform => "move_platform",
            Self::MoveTilt => "move_tilt",
            Self::StartTask => "start_task",
            Self::StopTask => "stop_task",
            Self::GetStatus => "get_status",
        }
    }

    /// Push action names that some services also use to answer this
    /// command. The same names arrive unsolicited, so matching on them can
    /// release the gate before the real reply.
    pub const fn push_aliases(self) -> &'static [&'static str] {
        match self {
            Self::GetConfig => &["config"],
            Self::GetHealth => &["health"],
            Self::GetMetrics => &["metrics"],
            Self::MovePlatform => &["update_platform"],
            Self::MoveTilt => &["update_tilt"],
            Self::StartTask | Self::StopTask => &["task_state"],
            Self::GetStatus => &["status"],
            Self::ListCameras
            | Self::Start
            | Self::Stop
            | Self::UpdateConfig => &[],
        }
    }

    /// Only the mirrored action name is a reply.
    pub fn is_answered_by(self, inbound_action: &str) -> bool {
        inbound_action == self.as_str()
    }

    pub fn is_answered_by_alias(self, inbound_action: &str) -> bool {
        self.is_answered_by(inbound_action) || self.push_aliases().contains(&inbound_action)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound command frame: `{action, source_id?, config?, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Command {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            source_id: None,
            config: None,
            data: None,
        }
    }

    pub fn for_source(action: Action, source_id: SourceId) -> Self {
        Self {
            source_id: Some(source_id),
            ..Self::new(action)
        }
    }

    pub fn list_cameras() -> Self {
        Self::new(Action::ListCameras)
    }

    pub fn start(source_id: SourceId) -> Self {
        Self::for_source(Action::Start, source_id)
    }

    pub fn stop(source_id: SourceId) -> Self {
        Self::for_source(Action::Stop, source_id)
    }

    pub fn get_config(source_id: SourceId) -> Self {
        Self::for_source(Action::GetConfig, source_id)
    }

    pub fn get_health(source_id: SourceId) -> Self {
        Self::for_source(Action::GetHealth, source_id)
    }

    pub fn get_metrics(source_id: SourceId) -> Self {
        Self::for_source(Action::GetMetrics, source_id)
    }

    /// The configuration is forwarded untouched; the service owns its schema.
    pub fn update_config(source_id: SourceId, config: Value) -> Self {
        Self {
            config: Some(config),
            ..Self::for_source(Action::UpdateConfig, source_id)
        }
    }

    pub fn move_platform(angle: f64) -> Self {
        Self {
            data: Some(json!({ "angle": angle })),
            ..Self::new(Action::MovePlatform)
        }
    }

    pub fn move_tilt(angle: f64) -> Self {
        Self {
            data: Some(json!({ "angle": angle })),
            ..Self::new(Action::MoveTilt)
        }
    }

    pub fn start_task(config: &ScanConfig) -> Self {
        Self {
            data: Some(config.to_wire()),
            ..Self::new(Action::StartTask)
        }
    }

    pub fn stop_task() -> Self {
        Self::new(Action::StopTask)
    }

    pub fn get_status() -> Self {
        Self::new(Action::GetStatus)
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Raw inbound object as it appears on the wire. The simulator builds its
/// replies with the same type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InboundEnvelope {
    pub fn reply(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    pub fn bare_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn is_failure(&self) -> bool {
        match self.success {
            Some(success) => !success,
            None => self.error.is_some() && self.data.is_none(),
        }
    }
}

/// Pipeline configuration snapshot. Only `source` and `models[].path` are
/// read locally; every other key survives a round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cuda: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_enabled: Option<bool>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineConfig {
    /// Source key as a string; numeric device indices are accepted too.
    pub fn source_key(&self) -> Option<String> {
        match self.source.as_ref()? {
            Value::String(source) => Some(source.clone()),
            Value::Number(index) => Some(index.to_string()),
            _ => None,
        }
    }

    pub fn model_paths(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|model| model.path.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    #[serde(default)]
    pub draw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iou: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes_filter: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counting: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<RemoteTaskReport>,
    #[serde(
        default,
        rename = "systemStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub system_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteTaskReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// Closed set of inbound message kinds, keyed by `action`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    SourceList(Vec<Source>),
    SourceStarted,
    SourceStopped,
    ConfigSnapshot(PipelineConfig),
    ConfigUpdated,
    Health(Value),
    Metrics(Value),
    Status(PlatformStatus),
    PlatformMoved { angle: f64 },
    TiltMoved { angle: f64 },
    TaskProgress { progress: f64 },
    TaskState { running: bool },
    SystemStatus { status: String },
    CounterUpdate(Value),
    /// Plain acknowledgement of an action that carries no typed payload.
    CommandResult,
    Ready,
    Failure,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub action: Option<String>,
    pub source_id: Option<SourceId>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub kind: InboundKind,
}

impl InboundMessage {
    /// Decodes one text frame. A frame holding an array is a batch of
    /// independent messages, returned in array order.
    pub fn decode_frame(text: &str) -> Vec<Result<Self, ProtocolError>> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => return vec![Err(ProtocolError::MalformedFrame(err))],
        };
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_value).collect(),
            other => vec![Self::from_value(other)],
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let envelope: InboundEnvelope =
            serde_json::from_value(value).map_err(ProtocolError::MalformedFrame)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: InboundEnvelope) -> Result<Self, ProtocolError> {
        let kind = classify(&envelope)?;
        Ok(Self {
            action: envelope.action,
            source_id: envelope.source_id,
            success: envelope.success,
            error: envelope.error,
            kind,
        })
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind, InboundKind::Failure)
    }

    /// Whether this message is the reply that releases `command`: the
    /// mirrored action, `ready`, or a bare error.
    pub fn answers(&self, command: &Command) -> bool {
        self.answers_with(command, Action::is_answered_by)
    }

    /// Like [`answers`](Self::answers), but push names listed in
    /// [`Action::push_aliases`] count as replies too.
    pub fn answers_by_alias(&self, command: &Command) -> bool {
        self.answers_with(command, Action::is_answered_by_alias)
    }

    fn answers_with(&self, command: &Command, matches: fn(Action, &str) -> bool) -> bool {
        if let (Some(sent), Some(received)) = (&command.source_id, &self.source_id) {
            if sent != received {
                return false;
            }
        }
        match self.action() {
            None => self.error.is_some(),
            Some(READY_ACTION) => true,
            Some(action) => matches(command.action, action),
        }
    }
}

fn classify(envelope: &InboundEnvelope) -> Result<InboundKind, ProtocolError> {
    if envelope.is_failure() {
        return Ok(InboundKind::Failure);
    }
    let Some(action) = envelope.action.as_deref() else {
        return Ok(InboundKind::Unrecognized);
    };
    let data = envelope.data.clone();

    let kind = match action {
        "list_cameras" => {
            let sources = serde_json::from_value(data.unwrap_or(Value::Array(Vec::new())))
                .map_err(|err| ProtocolError::invalid_payload(action, err))?;
            InboundKind::SourceList(sources)
        }
        "start" => InboundKind::SourceStarted,
        "stop" => InboundKind::SourceStopped,
        "get_config" | "config" => {
            let data = data.ok_or_else(|| ProtocolError::invalid_payload(action, "missing data"))?;
            let config = serde_json::from_value(data)
                .map_err(|err| ProtocolError::invalid_payload(action, err))?;
            InboundKind::ConfigSnapshot(config)
        }
        "update_config" => InboundKind::ConfigUpdated,
        "start_task" | "stop_task" => InboundKind::CommandResult,
        "get_health" | "health" => InboundKind::Health(data.unwrap_or(Value::Null)),
        "get_metrics" | "metrics" => InboundKind::Metrics(data.unwrap_or(Value::Null)),
        "get_status" | "status" => {
            let status = serde_json::from_value(data.unwrap_or_else(|| json!({})))
                .map_err(|err| ProtocolError::invalid_payload(action, err))?;
            InboundKind::Status(status)
        }
        "move_platform" | "update_platform" => InboundKind::PlatformMoved {
            angle: number_field(action, data.as_ref(), "angle")?,
        },
        "move_tilt" | "update_tilt" => InboundKind::TiltMoved {
            angle: number_field(action, data.as_ref(), "angle")?,
        },
        "task_progress" => InboundKind::TaskProgress {
            progress: number_field(action, data.as_ref(), "progress")?,
        },
        "task_state" => {
            let running = data
                .as_ref()
                .and_then(|data| data.get("running"))
                .and_then(Value::as_bool)
                .ok_or_else(|| ProtocolError::invalid_payload(action, "missing `running`"))?;
            InboundKind::TaskState { running }
        }
        "system_status" => {
            let status = data
                .as_ref()
                .and_then(|data| data.get("status"))
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::invalid_payload(action, "missing `status`"))?;
            InboundKind::SystemStatus {
                status: status.to_string(),
            }
        }
        "counter_update" | "counters" => InboundKind::CounterUpdate(data.unwrap_or(Value::Null)),
        READY_ACTION => InboundKind::Ready,
        _ => InboundKind::Unrecognized,
    };
    Ok(kind)
}

/// Reads a numeric field; numeric strings are accepted as the UI sends them.
fn number_field(action: &str, data: Option<&Value>, field: &str) -> Result<f64, ProtocolError> {
    let value = data
        .and_then(|data| data.get(field))
        .ok_or_else(|| ProtocolError::invalid_payload(action, format!("missing `{field}`")))?;
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    number.ok_or_else(|| ProtocolError::invalid_payload(action, format!("`{field}` is not a number")))
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
