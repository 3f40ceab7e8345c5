//! Scan configuration and the position planner.
//!
//! A scan visits every pair of (tilt level, rotation step). Tilt levels are
//! spread evenly over `[0, 90]`; rotation steps run from 0 up to, but not
//! including, 360 degrees. The planner is a simple sweep and makes no attempt
//! to minimise travel.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ScanConfigError;

pub const VERTICAL_ANGLES_RANGE: RangeInclusive<u32> = 1..=10;
pub const HORIZONTAL_STEP_RANGE: RangeInclusive<u32> = 1..=90;
pub const MOVEMENT_DELAY_RANGE: RangeInclusive<f64> = 0.5..=10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Full rotation at each tilt level.
    #[default]
    Sequential,
    /// Every tilt level at each rotation step.
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    pub vertical_angles: u32,
    pub horizontal_step: u32,
    /// Seconds to wait at each position.
    pub movement_delay: f64,
    pub operation_mode: OperationMode,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            vertical_angles: 3,
            horizontal_step: 20,
            movement_delay: 2.0,
            operation_mode: OperationMode::Sequential,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ScanConfigError> {
        if !VERTICAL_ANGLES_RANGE.contains(&self.vertical_angles) {
            return Err(ScanConfigError::VerticalAngles(self.vertical_angles));
        }
        if !HORIZONTAL_STEP_RANGE.contains(&self.horizontal_step) {
            return Err(ScanConfigError::HorizontalStep(self.horizontal_step));
        }
        if !MOVEMENT_DELAY_RANGE.contains(&self.movement_delay) {
            return Err(ScanConfigError::MovementDelay(self.movement_delay));
        }
        Ok(())
    }

    /// Payload of the `start_task` command.
    pub fn to_wire(&self) -> Value {
        json!({
            "verticalAngles": self.vertical_angles,
            "horizontalStep": self.horizontal_step,
            "movementDelay": self.movement_delay,
            "operationMode": self.operation_mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub rotation: f64,
    pub tilt: f64,
    /// 1-based emission order.
    pub index: usize,
}

/// Evenly spaced tilt levels from 0 to 90 degrees.
///
/// A single level sits at 0 degrees rather than dividing by zero.
pub fn tilt_levels(vertical_angles: u32) -> Vec<f64> {
    match vertical_angles {
        0 => Vec::new(),
        1 => vec![0.0],
        n => {
            let spacing = 90.0 / f64::from(n - 1);
            (0..n).map(|i| spacing * f64::from(i)).collect()
        }
    }
}

pub fn rotation_steps(horizontal_step: u32) -> Vec<f64> {
    if horizontal_step == 0 {
        return Vec::new();
    }
    (0..360u32)
        .step_by(horizontal_step as usize)
        .map(f64::from)
        .collect()
}

pub fn plan(config: &ScanConfig) -> Vec<Position> {
    let tilts = tilt_levels(config.vertical_angles);
    let rotations = rotation_steps(config.horizontal_step);

    let pairs: Vec<(f64, f64)> = match config.operation_mode {
        OperationMode::Sequential => tilts
            .iter()
            .flat_map(|&tilt| rotations.iter().map(move |&rotation| (rotation, tilt)))
            .collect(),
        OperationMode::Alternate => rotations
            .iter()
            .flat_map(|&rotation| tilts.iter().map(move |&tilt| (rotation, tilt)))
            .collect(),
    };

    pairs
        .into_iter()
        .enumerate()
        .map(|(i, (rotation, tilt))| Position {
            rotation,
            tilt,
            index: i + 1,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPreset {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub config: ScanConfig,
}

pub fn builtin_presets() -> [ScanPreset; 4] {
    [
        ScanPreset {
            id: "quick-scan",
            name: "Quick scan 4x90°",
            description: "Fast sweep with 4 tilt levels and 90° rotation steps",
            config: ScanConfig {
                vertical_angles: 4,
                horizontal_step: 90,
                movement_delay: 1.0,
                operation_mode: OperationMode::Sequential,
            },
        },
        ScanPreset {
            id: "high-def-vertical",
            name: "High definition vertical",
            description: "Detailed sweep with 8 tilt levels and 15° rotation steps",
            config: ScanConfig {
                vertical_angles: 8,
                horizontal_step: 15,
                movement_delay: 3.0,
                operation_mode: OperationMode::Sequential,
            },
        },
        ScanPreset {
            id: "three-level-inspection",
            name: "Three level inspection",
            description: "Standard inspection over 3 tilt levels",
            config: ScanConfig {
                vertical_angles: 3,
                horizontal_step: 30,
                movement_delay: 2.0,
                operation_mode: OperationMode::Alternate,
            },
        },
        ScanPreset {
            id: "ultra-fine-scan",
            name: "Ultra fine scan",
            description: "Precision sweep with 5° steps and 10 tilt levels",
            config: ScanConfig {
                vertical_angles: 10,
                horizontal_step: 5,
                movement_delay: 4.0,
                operation_mode: OperationMode::Sequential,
            },
        },
    ]
}

pub fn find_preset(id: &str) -> Option<ScanPreset> {
    builtin_presets().into_iter().find(|preset| preset.id == id)
}

#[cfg(test)]
#[path = "tests/scan_tests.rs"]
mod tests;
