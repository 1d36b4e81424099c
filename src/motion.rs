//! Motion orchestration
//!
//! Validates joint targets, issues `ptptojointpos` and waits for the monitor
//! to report completion. While a motion is in flight a watcher task keeps
//! joint and pose telemetry fresh.

use crate::codec::EkiCommand;
use crate::config::MotionConfig;
use crate::monitor::SessionSignals;
use crate::state::{ProgramStatus, StateStore};
use crate::transport::CommandSender;
use crate::{EkiError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a motion request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionOutcome {
    /// The device reported success
    Completed,
    /// No completion arrived within the motion timeout
    TimedOut,
    /// A waypoint was not issued because another motion was in flight
    Skipped,
}

/// Stops the watcher once the wait is over. If the waiting future is
/// dropped before the motion settles, the motion flag is released too.
struct MotionGuard {
    state: Arc<StateStore>,
    seq: u64,
    cancel: Arc<AtomicBool>,
}

impl Drop for MotionGuard {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if self.state.finish_motion_seq(self.seq) {
            warn!("Motion wait was cancelled, releasing motion {}", self.seq);
        }
    }
}

pub struct MotionOrchestrator {
    sender: CommandSender,
    state: Arc<StateStore>,
    signals: Arc<SessionSignals>,
    config: MotionConfig,
    program_state_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl MotionOrchestrator {
    pub fn new(
        sender: CommandSender,
        state: Arc<StateStore>,
        signals: Arc<SessionSignals>,
        config: MotionConfig,
        program_state_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sender,
            state,
            signals,
            config,
            program_state_timeout,
            shutdown,
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Move to `target` (degrees, one per joint) and wait for the device to
    /// finish. Validation failures are returned before anything is sent.
    pub async fn move_to_joint_positions(&self, target: &[f64]) -> Result<MotionOutcome> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(EkiError::Closed);
        }

        self.validate_target(target)?;

        if self.state.is_moving() {
            return Err(EkiError::Busy);
        }

        if self.config.safe_mode() {
            self.ensure_program_running().await?;
        }

        let seq = self.state.begin_motion()?;
        // Armed before the first await so a dropped caller never leaves the flag set
        let guard = MotionGuard {
            state: self.state.clone(),
            seq,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        self.signals.completion.reset().await;

        let args = self.format_target(target);
        if let Err(e) = self.sender.send(EkiCommand::SetJointPosition, &args).await {
            // The command never left, so no completion will come
            self.state.finish_motion_seq(seq);
            return Err(e);
        }
        info!("Motion {} issued: {:?}", seq, target);

        self.spawn_watcher(seq, guard.cancel.clone());
        let timeout = self.config.timeout();

        tokio::select! {
            completed = self.signals.completion.wait(timeout) => {
                if completed {
                    Ok(MotionOutcome::Completed)
                } else {
                    self.state.finish_motion_seq(seq);
                    warn!("Motion did not complete within {:?}", timeout);
                    Ok(MotionOutcome::TimedOut)
                }
            }
            _ = self.closed() => {
                self.state.finish_motion_seq(seq);
                Err(EkiError::Closed)
            }
        }
    }

    /// Move through several targets in order. A target is skipped if a
    /// motion is still in flight when its turn comes.
    pub async fn move_through(&self, targets: &[Vec<f64>]) -> Result<Vec<MotionOutcome>> {
        let mut outcomes = Vec::with_capacity(targets.len());

        for (index, target) in targets.iter().enumerate() {
            if self.state.is_moving() {
                warn!("Skipping waypoint {} while the robot is moving", index);
                outcomes.push(MotionOutcome::Skipped);
                continue;
            }
            outcomes.push(self.move_to_joint_positions(target).await?);
        }

        Ok(outcomes)
    }

    /// Halt the arm and refresh telemetry once
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping robot");
        self.sender.send::<&str>(EkiCommand::SetStop, &[]).await?;
        self.refresh_telemetry().await
    }

    /// Ask for fresh joint and pose readings
    pub async fn refresh_telemetry(&self) -> Result<()> {
        self.sender.send::<&str>(EkiCommand::GetJointPosition, &[]).await?;
        self.sender.send::<&str>(EkiCommand::GetEndPosition, &[]).await
    }

    /// Query the remote program and wait for the monitor to apply the answer
    pub async fn query_program_status(&self) -> Result<ProgramStatus> {
        self.signals.program_info.reset().await;
        self.sender.send::<&str>(EkiCommand::GetProgramInfo, &[]).await?;

        if !self.signals.program_info.wait(self.program_state_timeout).await {
            return Err(EkiError::Timeout("program state".to_string()));
        }
        Ok(self.state.program_status())
    }

    async fn ensure_program_running(&self) -> Result<()> {
        let status = self.query_program_status().await?;
        if status != ProgramStatus::Running {
            warn!("Refusing motion, remote program is {}", status);
            return Err(EkiError::UnsafeState(status));
        }
        Ok(())
    }

    fn validate_target(&self, target: &[f64]) -> Result<()> {
        let joint_count = self.state.joint_count();
        if target.len() != joint_count {
            return Err(EkiError::JointCount {
                expected: joint_count,
                actual: target.len(),
            });
        }

        let limits = self
            .state
            .joint_limits()
            .ok_or_else(|| EkiError::NotReady("joint limits not received".to_string()))?;

        for (joint, (&value, limit)) in target.iter().zip(limits.iter()).enumerate() {
            if !limit.contains(value) {
                return Err(EkiError::OutOfRange {
                    joint,
                    value,
                    min: limit.min,
                    max: limit.max,
                });
            }
        }
        Ok(())
    }

    /// Joint values at the configured precision, then zero placeholders for
    /// the external axes
    fn format_target(&self, target: &[f64]) -> Vec<String> {
        let places = self.config.decimal_places() as usize;
        target
            .iter()
            .map(|value| format!("{:.*}", places, value))
            .chain(std::iter::repeat("0".to_string()).take(self.config.external_axes()))
            .collect()
    }

    fn spawn_watcher(&self, seq: u64, cancel: Arc<AtomicBool>) {
        let watcher = MotionWatcher {
            sender: self.sender.clone(),
            state: self.state.clone(),
            seq,
            shutdown: self.shutdown.clone(),
            cancel,
            poll_interval: self.config.poll_interval(),
            timeout: self.config.timeout(),
        };

        let handle = tokio::spawn(watcher.run());
        let mut watchers = self.watchers.lock();
        watchers.retain(|h| !h.is_finished());
        watchers.push(handle);
    }

    async fn closed(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Wait for every watcher task to exit
    pub async fn join_watchers(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.watchers.lock());
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

/// Polls telemetry while a motion is in flight
struct MotionWatcher {
    sender: CommandSender,
    state: Arc<StateStore>,
    seq: u64,
    shutdown: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
    timeout: Duration,
}

impl MotionWatcher {
    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
            || self.cancel.load(Ordering::Relaxed)
            || !self.state.is_motion_active(self.seq)
    }

    async fn run(self) {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.should_stop() || tokio::time::Instant::now() >= deadline {
                break;
            }

            for command in [EkiCommand::GetJointPosition, EkiCommand::GetEndPosition] {
                if let Err(e) = self.sender.send::<&str>(command, &[]).await {
                    warn!("Telemetry poll failed: {}", e);
                }
            }
        }

        debug!("Motion watcher {} exited", self.seq);
    }
}
