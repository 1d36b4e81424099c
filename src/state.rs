//! Device state store
//!
//! Everything the driver knows about the arm lives behind one lock. The
//! response monitor is the only writer of telemetry fields; the motion
//! orchestrator only flips `is_moving`. Readers get cloned snapshots so a
//! joint vector is never observed together with a stale motion flag.

use crate::{EkiError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state of the EKI server program on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgramStatus {
    Free,
    Reset,
    Running,
    Stopped,
    Ended,
    #[default]
    Unknown,
}

impl ProgramStatus {
    /// Map a status keyword from the wire; anything unrecognised is `Unknown`
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "Free" => ProgramStatus::Free,
            "Reset" => ProgramStatus::Reset,
            "Running" => ProgramStatus::Running,
            "Stopped" => ProgramStatus::Stopped,
            "Ended" => ProgramStatus::Ended,
            _ => ProgramStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgramStatus::Free => "Free",
            ProgramStatus::Reset => "Reset",
            ProgramStatus::Running => "Running",
            ProgramStatus::Stopped => "Stopped",
            ProgramStatus::Ended => "Ended",
            ProgramStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static identity reported by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub serial_number: String,
    pub robot_type: String,
    pub software_version: String,
    pub operating_mode: String,
}

impl DeviceIdentity {
    pub fn is_complete(&self) -> bool {
        [
            &self.name,
            &self.serial_number,
            &self.robot_type,
            &self.software_version,
            &self.operating_mode,
        ]
        .iter()
        .all(|field| !field.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Name,
    SerialNumber,
    RobotType,
    SoftwareVersion,
    OperatingMode,
}

/// Which side of the joint limits a batch describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBound {
    Min,
    Max,
}

/// Exclusive joint range in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub min: f64,
    pub max: f64,
}

impl JointLimit {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Bounds are exclusive: a value equal to either limit is rejected
    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }
}

/// End effector pose as reported by `getcurrentpos`.
///
/// Position is in millimetres. Orientation is stored exactly as the
/// controller sends it, in radians; no conversion to degrees is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Full state snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    pub identity: DeviceIdentity,
    /// Negative limit batch, `None` until received
    pub limits_min: Option<Vec<f64>>,
    /// Positive limit batch, `None` until received
    pub limits_max: Option<Vec<f64>>,
    pub joints: Vec<f64>,
    pub end_effector_pose: Option<Pose>,
    pub is_moving: bool,
    /// Bumped each time a motion starts
    #[serde(skip)]
    pub motion_seq: u64,
    pub program_status: ProgramStatus,
    pub program_name: String,
    pub last_telemetry: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Paired limits, available once both batches have arrived
    pub fn joint_limits(&self) -> Option<Vec<JointLimit>> {
        let min = self.limits_min.as_ref()?;
        let max = self.limits_max.as_ref()?;
        Some(
            min.iter()
                .zip(max.iter())
                .map(|(&min, &max)| JointLimit::new(min, max))
                .collect(),
        )
    }
}

/// Mutex-guarded owner of [`DeviceState`]
#[derive(Debug)]
pub struct StateStore {
    joint_count: usize,
    inner: Mutex<DeviceState>,
}

impl StateStore {
    pub fn new(joint_count: usize) -> Self {
        Self {
            joint_count,
            inner: Mutex::new(DeviceState::default()),
        }
    }

    pub fn joint_count(&self) -> usize {
        self.joint_count
    }

    pub fn snapshot(&self) -> DeviceState {
        self.inner.lock().clone()
    }

    /// Forget everything learned from the device
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        // Keep numbering motions across sessions
        let motion_seq = state.motion_seq;
        *state = DeviceState {
            motion_seq,
            ..DeviceState::default()
        };
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.inner.lock().identity.clone()
    }

    pub fn set_identity(&self, field: IdentityField, value: String) {
        let mut state = self.inner.lock();
        let slot = match field {
            IdentityField::Name => &mut state.identity.name,
            IdentityField::SerialNumber => &mut state.identity.serial_number,
            IdentityField::RobotType => &mut state.identity.robot_type,
            IdentityField::SoftwareVersion => &mut state.identity.software_version,
            IdentityField::OperatingMode => &mut state.identity.operating_mode,
        };
        *slot = value;
    }

    /// Replace one side of the joint limits. A batch of the wrong length is
    /// rejected and the previous values stay in place.
    pub fn set_limit_bound(&self, bound: LimitBound, values: Vec<f64>) -> Result<()> {
        self.check_len(&values)?;
        let mut state = self.inner.lock();
        match bound {
            LimitBound::Min => state.limits_min = Some(values),
            LimitBound::Max => state.limits_max = Some(values),
        }
        Ok(())
    }

    /// Replace both sides of the joint limits at once
    pub fn set_joint_limits(&self, limits: &[JointLimit]) -> Result<()> {
        if limits.len() != self.joint_count {
            return Err(EkiError::JointCount {
                expected: self.joint_count,
                actual: limits.len(),
            });
        }
        let mut state = self.inner.lock();
        state.limits_min = Some(limits.iter().map(|l| l.min).collect());
        state.limits_max = Some(limits.iter().map(|l| l.max).collect());
        Ok(())
    }

    pub fn joint_limits(&self) -> Option<Vec<JointLimit>> {
        self.inner.lock().joint_limits()
    }

    pub fn set_joints(&self, joints: Vec<f64>) -> Result<()> {
        self.check_len(&joints)?;
        let mut state = self.inner.lock();
        state.joints = joints;
        state.last_telemetry = Some(Utc::now());
        Ok(())
    }

    pub fn joints(&self) -> Vec<f64> {
        self.inner.lock().joints.clone()
    }

    pub fn set_end_effector_pose(&self, pose: Pose) {
        let mut state = self.inner.lock();
        state.end_effector_pose = Some(pose);
        state.last_telemetry = Some(Utc::now());
    }

    pub fn end_effector_pose(&self) -> Option<Pose> {
        self.inner.lock().end_effector_pose
    }

    pub fn set_program(&self, name: String, status: ProgramStatus) {
        let mut state = self.inner.lock();
        state.program_name = name;
        state.program_status = status;
    }

    pub fn program_status(&self) -> ProgramStatus {
        self.inner.lock().program_status
    }

    pub fn is_moving(&self) -> bool {
        self.inner.lock().is_moving
    }

    /// Mark a motion as in flight, failing if one already is. Returns the
    /// sequence number identifying this motion.
    pub fn begin_motion(&self) -> Result<u64> {
        let mut state = self.inner.lock();
        if state.is_moving {
            return Err(EkiError::Busy);
        }
        state.is_moving = true;
        state.motion_seq += 1;
        Ok(state.motion_seq)
    }

    /// Clear the motion flag, returning whether a motion was in flight
    pub fn finish_motion(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().is_moving, false)
    }

    /// Whether motion `seq` is the one still in flight
    pub fn is_motion_active(&self, seq: u64) -> bool {
        let state = self.inner.lock();
        state.is_moving && state.motion_seq == seq
    }

    /// Clear the motion flag only if motion `seq` is the one in flight
    pub fn finish_motion_seq(&self, seq: u64) -> bool {
        let mut state = self.inner.lock();
        if state.is_moving && state.motion_seq == seq {
            state.is_moving = false;
            return true;
        }
        false
    }

    /// Identity, both limit batches and a joint reading have all arrived
    pub fn is_populated(&self) -> bool {
        let state = self.inner.lock();
        state.identity.is_complete()
            && state.limits_min.is_some()
            && state.limits_max.is_some()
            && !state.joints.is_empty()
    }

    fn check_len(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.joint_count {
            return Err(EkiError::JointCount {
                expected: self.joint_count,
                actual: values.len(),
            });
        }
        Ok(())
    }
}
