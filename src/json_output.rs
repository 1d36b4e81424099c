//! JSON events for the command line front end
//!
//! Every event is one line on stdout with a `type` tag and a UTC timestamp,
//! so the output can be piped into other tools.

use crate::motion::MotionOutcome;
use crate::state::{DeviceIdentity, DeviceState, Pose, ProgramStatus};
use crate::transport::TransportStats;
use crate::EkiError;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

fn round_to(value: f64, decimal_places: u32) -> f64 {
    let factor = 10f64.powi(decimal_places as i32);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEventType {
    MotionStarted,
    MotionCompleted,
    MotionTimedOut,
    MotionSkipped,
    MotionRejected,
    MotionFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MotionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: MotionEventType,
    pub target: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MotionEvent {
    fn new(event_type: MotionEventType, target: &[f64], reason: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type,
            target: target.to_vec(),
            reason,
        }
    }

    pub fn started(target: &[f64]) -> Self {
        Self::new(MotionEventType::MotionStarted, target, None)
    }

    pub fn finished(target: &[f64], outcome: MotionOutcome) -> Self {
        let event_type = match outcome {
            MotionOutcome::Completed => MotionEventType::MotionCompleted,
            MotionOutcome::TimedOut => MotionEventType::MotionTimedOut,
            MotionOutcome::Skipped => MotionEventType::MotionSkipped,
        };
        Self::new(event_type, target, None)
    }

    /// Validation failures are `motion_rejected`, anything else `motion_failed`
    pub fn error(target: &[f64], error: &EkiError) -> Self {
        let event_type = if error.is_rejection() {
            MotionEventType::MotionRejected
        } else {
            MotionEventType::MotionFailed
        };
        Self::new(event_type, target, Some(error.to_string()))
    }
}

/// Device state as published on stdout
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub identity: DeviceIdentity,
    pub joints: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
    pub is_moving: bool,
    pub program_name: String,
    pub program_status: ProgramStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_telemetry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TransportStats>,
}

impl StateEvent {
    pub fn from_state(state: &DeviceState, decimal_places: u32) -> Self {
        let pose = state.end_effector_pose.map(|p| Pose {
            x: round_to(p.x, decimal_places),
            y: round_to(p.y, decimal_places),
            z: round_to(p.z, decimal_places),
            yaw: round_to(p.yaw, decimal_places),
            pitch: round_to(p.pitch, decimal_places),
            roll: round_to(p.roll, decimal_places),
        });

        Self {
            timestamp: current_timestamp(),
            event_type: "state".to_string(),
            identity: state.identity.clone(),
            joints: state
                .joints
                .iter()
                .map(|&j| round_to(j, decimal_places))
                .collect(),
            pose,
            is_moving: state.is_moving,
            program_name: state.program_name.clone(),
            program_status: state.program_status,
            last_telemetry: state.last_telemetry,
            traffic: None,
        }
    }

    pub fn with_traffic(mut self, stats: TransportStats) -> Self {
        self.traffic = Some(stats);
        self
    }
}

/// Joint and Cartesian position only
#[derive(Debug, Clone, Serialize)]
pub struct PoseEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub joints: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
}

impl From<StateEvent> for PoseEvent {
    fn from(state: StateEvent) -> Self {
        Self {
            timestamp: state.timestamp,
            event_type: "pose".to_string(),
            joints: state.joints,
            pose: state.pose,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
}

impl ErrorEvent {
    pub fn new(error: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
        }
    }
}

/// Print one event as a JSON line on stdout
pub fn output_event<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}
