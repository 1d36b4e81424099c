//! Background response monitor
//!
//! Reads from the transport, reassembles frames and routes each response to
//! the state store by its leading command token. A response whose first
//! argument is `success` is treated as a completion and never dispatched.

use crate::codec::{self, AxisLayout, EkiCommand, FrameBuffer, Response};
use crate::state::{IdentityField, LimitBound, Pose, ProgramStatus, StateStore};
use crate::transport::Transport;
use crate::{EkiError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Fields of `getcurrentpos` before the external axes: x, y, z, a, b, c, status, turn
const END_POSITION_MIN_ARGS: usize = 8;

/// Single-slot wakeup shared between the monitor and one waiter.
///
/// Signals do not accumulate: a second `signal` before anyone waits is
/// dropped, so a stale completion can release at most one wait.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn signal(&self) {
        // A full slot already means "done"
        let _ = self.tx.try_send(());
    }

    /// Drop any signal left over from an earlier request
    pub async fn reset(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Wait for the next signal. Returns false when `timeout` elapses first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.rx.lock().await;
        matches!(tokio::time::timeout(timeout, rx.recv()).await, Ok(Some(())))
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakeups the monitor delivers to request/response callers
#[derive(Debug, Default)]
pub struct SessionSignals {
    /// Motion or stop finished
    pub completion: CompletionSignal,
    /// A `getprograminfo` response was applied
    pub program_info: CompletionSignal,
}

/// One decoded response, classified
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// An action reported `success`
    Completion { discriminator: String },
    Telemetry(Telemetry),
    Unrecognized(String),
}

/// Data carried by a query response
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Identity(IdentityField, String),
    Limits(LimitBound, Vec<f64>),
    Joints(Vec<f64>),
    EndPosition(Pose),
    ProgramState { name: String, status: ProgramStatus },
    /// Echo of an action that has no effect on state
    Ack(EkiCommand),
}

/// Classify a response without touching any state
pub fn classify(response: &Response, layout: AxisLayout) -> Result<MonitorEvent> {
    if response.is_success() {
        return Ok(MonitorEvent::Completion {
            discriminator: response.discriminator.clone(),
        });
    }

    let command = match response.command() {
        Some(command) => command,
        None => return Ok(MonitorEvent::Unrecognized(response.discriminator.clone())),
    };

    let telemetry = match command {
        EkiCommand::GetRobotName => identity(response, IdentityField::Name)?,
        EkiCommand::GetRobotSerialNum => identity(response, IdentityField::SerialNumber)?,
        EkiCommand::GetRobotType => identity(response, IdentityField::RobotType)?,
        EkiCommand::GetSoftwareVersion => identity(response, IdentityField::SoftwareVersion)?,
        EkiCommand::GetOperatingMode => identity(response, IdentityField::OperatingMode)?,
        EkiCommand::GetJointNegLimit => {
            Telemetry::Limits(LimitBound::Min, axis_values(response, layout)?)
        }
        EkiCommand::GetJointPosLimit => {
            Telemetry::Limits(LimitBound::Max, axis_values(response, layout)?)
        }
        EkiCommand::GetJointPosition => Telemetry::Joints(axis_values(response, layout)?),
        EkiCommand::GetEndPosition => Telemetry::EndPosition(end_position(response)?),
        EkiCommand::GetProgramInfo => program_state(response)?,
        EkiCommand::SetJointPosition | EkiCommand::SetStop => Telemetry::Ack(command),
    };

    Ok(MonitorEvent::Telemetry(telemetry))
}

fn expect_args(response: &Response, expected: usize) -> Result<()> {
    if response.args.len() != expected {
        return Err(EkiError::parse(
            &response.discriminator,
            format!("expected {} arguments, got {}", expected, response.args.len()),
        ));
    }
    Ok(())
}

fn identity(response: &Response, field: IdentityField) -> Result<Telemetry> {
    expect_args(response, 1)?;
    Ok(Telemetry::Identity(field, response.args[0].clone()))
}

fn parse_number(command: &str, token: &str) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| EkiError::parse(command, format!("'{}' is not a number", token)))
}

/// Joint-shaped vectors carry every axis; only the controlled joints are kept
fn axis_values(response: &Response, layout: AxisLayout) -> Result<Vec<f64>> {
    expect_args(response, layout.width())?;
    response.args[..layout.joints]
        .iter()
        .map(|token| parse_number(&response.discriminator, token))
        .collect()
}

fn end_position(response: &Response) -> Result<Pose> {
    if response.args.len() < END_POSITION_MIN_ARGS {
        return Err(EkiError::parse(
            &response.discriminator,
            format!(
                "expected at least {} arguments, got {}",
                END_POSITION_MIN_ARGS,
                response.args.len()
            ),
        ));
    }

    let values = response.args[..6]
        .iter()
        .map(|token| parse_number(&response.discriminator, token))
        .collect::<Result<Vec<f64>>>()?;

    Ok(Pose {
        x: values[0],
        y: values[1],
        z: values[2],
        yaw: values[3],
        pitch: values[4],
        roll: values[5],
    })
}

fn program_state(response: &Response) -> Result<Telemetry> {
    expect_args(response, 2)?;
    Ok(Telemetry::ProgramState {
        name: response.args[0].clone(),
        status: ProgramStatus::from_keyword(&response.args[1]),
    })
}

/// Demultiplexes device responses onto the state store
pub struct ResponseMonitor {
    transport: Arc<Transport>,
    state: Arc<StateStore>,
    signals: Arc<SessionSignals>,
    layout: AxisLayout,
}

impl ResponseMonitor {
    pub fn new(
        transport: Arc<Transport>,
        state: Arc<StateStore>,
        signals: Arc<SessionSignals>,
        layout: AxisLayout,
    ) -> Self {
        Self {
            transport,
            state,
            signals,
            layout,
        }
    }

    /// Start the read loop. The task ends once `shutdown` is set; it notices
    /// within one read deadline.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: Arc<AtomicBool>) {
        info!("Response monitor started");
        let mut frames = FrameBuffer::new();

        while !shutdown.load(Ordering::Relaxed) {
            let bytes = match self.transport.receive().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("Failed to read from device: {}", e);
                    frames.clear();
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    continue;
                }
            };

            for frame in frames.push(&bytes) {
                self.handle_frame(&frame);
            }
        }

        info!("Response monitor stopped");
    }

    /// Decode one frame and apply it. Malformed responses are logged and
    /// leave the state untouched.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<MonitorEvent> {
        let response = codec::decode(frame);
        match classify(&response, self.layout) {
            Ok(event) => {
                self.apply(&event);
                Some(event)
            }
            Err(e) => {
                warn!("Discarding response: {}", e);
                None
            }
        }
    }

    fn apply(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Completion { discriminator } => {
                if self.state.finish_motion() {
                    info!("Motion completed ({})", discriminator);
                    self.signals.completion.signal();
                } else {
                    debug!("{} reported success with no motion in flight", discriminator);
                }
            }
            MonitorEvent::Telemetry(telemetry) => self.apply_telemetry(telemetry),
            MonitorEvent::Unrecognized(discriminator) => {
                warn!("Ignoring unrecognized response '{}'", discriminator);
            }
        }
    }

    fn apply_telemetry(&self, telemetry: &Telemetry) {
        let applied = match telemetry {
            Telemetry::Identity(field, value) => {
                self.state.set_identity(*field, value.clone());
                Ok(())
            }
            Telemetry::Limits(bound, values) => self.state.set_limit_bound(*bound, values.clone()),
            Telemetry::Joints(values) => self.state.set_joints(values.clone()),
            Telemetry::EndPosition(pose) => {
                self.state.set_end_effector_pose(*pose);
                Ok(())
            }
            Telemetry::ProgramState { name, status } => {
                self.state.set_program(name.clone(), *status);
                self.signals.program_info.signal();
                Ok(())
            }
            Telemetry::Ack(command) => {
                debug!("Device acknowledged {}", command);
                Ok(())
            }
        };

        if let Err(e) = applied {
            warn!("Discarding telemetry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JointLimit;
    use tokio::io::AsyncWriteExt;

    fn monitor(joints: usize) -> (ResponseMonitor, Arc<StateStore>, Arc<SessionSignals>) {
        let state = Arc::new(StateStore::new(joints));
        let signals = Arc::new(SessionSignals::default());
        let monitor = ResponseMonitor::new(
            Arc::new(Transport::new(Duration::from_millis(20))),
            state.clone(),
            signals.clone(),
            AxisLayout::new(joints, joints),
        );
        (monitor, state, signals)
    }

    #[test]
    fn test_identity_requires_exactly_one_argument() {
        let (monitor, state, _) = monitor(6);

        monitor.handle_frame(b"getrobotname,KR10;");
        assert_eq!(state.identity().name, "KR10");

        assert!(monitor.handle_frame(b"getrobotname,KR10,extra;").is_none());
        assert!(monitor.handle_frame(b"getrobotname;").is_none());
        assert_eq!(state.identity().name, "KR10");
    }

    #[test]
    fn test_limits_keep_first_joint_values() {
        let (monitor, state, _) = monitor(2);

        monitor.handle_frame(b"getnegjntlim,-170,-120,0,0;");
        monitor.handle_frame(b"getposjntlim,170,120,0,0;");
        assert_eq!(
            state.joint_limits(),
            Some(vec![JointLimit::new(-170.0, 170.0), JointLimit::new(-120.0, 120.0)])
        );
    }

    #[test]
    fn test_malformed_limits_leave_previous_batch() {
        let (monitor, state, _) = monitor(2);
        monitor.handle_frame(b"getnegjntlim,-1,-2,0,0;");

        assert!(monitor.handle_frame(b"getnegjntlim,-9,-9;").is_none());
        assert!(monitor.handle_frame(b"getnegjntlim,-9,oops,0,0;").is_none());
        assert_eq!(state.snapshot().limits_min, Some(vec![-1.0, -2.0]));
    }

    #[test]
    fn test_joint_arity_is_enforced() {
        let (monitor, state, _) = monitor(6);

        monitor.handle_frame(b"getcurrentjoints,1,2,3,4,5,6,0,0,0,0,0,0;");
        assert_eq!(state.joints(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert!(monitor.handle_frame(b"getcurrentjoints,9,9,9,9,9,9;").is_none());
        assert_eq!(state.joints(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_end_position_reads_from_first_argument() {
        let (monitor, state, _) = monitor(6);

        monitor.handle_frame(b"getcurrentpos,100.5,200,300,0.1,0.2,0.3,2,35,0,0,0,0,0,0;");
        // Orientation stays in radians
        assert_eq!(
            state.end_effector_pose(),
            Some(Pose {
                x: 100.5,
                y: 200.0,
                z: 300.0,
                yaw: 0.1,
                pitch: 0.2,
                roll: 0.3,
            })
        );

        assert!(monitor.handle_frame(b"getcurrentpos,1,2,3,4,5,6,7;").is_none());
        assert_eq!(state.end_effector_pose().map(|p| p.x), Some(100.5));
    }

    #[tokio::test]
    async fn test_program_info_sets_name_and_status() {
        let (monitor, state, signals) = monitor(6);

        monitor.handle_frame(b"getprograminfo,ekiMain,Running;");
        let snapshot = state.snapshot();
        assert_eq!(snapshot.program_name, "ekiMain");
        assert_eq!(snapshot.program_status, ProgramStatus::Running);
        assert!(signals.program_info.wait(Duration::from_millis(10)).await);

        assert!(monitor.handle_frame(b"getprograminfo,ekiMain;").is_none());
        assert_eq!(state.snapshot().program_name, "ekiMain");
        assert_eq!(state.program_status(), ProgramStatus::Running);
        assert!(!signals.program_info.wait(Duration::from_millis(10)).await);

        monitor.handle_frame(b"getprograminfo,other,Paused;");
        assert_eq!(state.program_status(), ProgramStatus::Unknown);
    }

    #[tokio::test]
    async fn test_success_releases_exactly_one_wait() {
        let (monitor, state, signals) = monitor(6);
        state.begin_motion().unwrap();

        let event = monitor.handle_frame(b"ptptojointpos,success;");
        assert_eq!(
            event,
            Some(MonitorEvent::Completion {
                discriminator: "ptptojointpos".to_string()
            })
        );
        assert!(!state.is_moving());
        assert!(signals.completion.wait(Duration::from_millis(10)).await);
        assert!(!signals.completion.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_success_without_motion_does_not_signal() {
        let (monitor, _, signals) = monitor(6);
        monitor.handle_frame(b"setstop,success;");
        assert!(!signals.completion.wait(Duration::from_millis(10)).await);
    }

    #[test]
    fn test_echo_and_unknown_leave_state_alone() {
        let (monitor, state, _) = monitor(6);

        let event = monitor.handle_frame(b"ptptojointpos,1,2,3,4,5,6,0,0,0,0,0,0;");
        assert_eq!(
            event,
            Some(MonitorEvent::Telemetry(Telemetry::Ack(EkiCommand::SetJointPosition)))
        );
        let event = monitor.handle_frame(b"getweather,sunny;");
        assert_eq!(event, Some(MonitorEvent::Unrecognized("getweather".to_string())));
        assert!(state.joints().is_empty());
    }

    #[tokio::test]
    async fn test_read_loop_applies_split_frames_and_stops() {
        let (mut device, host) = tokio::io::duplex(1024);
        let state = Arc::new(StateStore::new(1));
        let signals = Arc::new(SessionSignals::default());
        let transport = Arc::new(Transport::new(Duration::from_millis(20)));
        transport.attach(host).await.unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ResponseMonitor::new(
            transport,
            state.clone(),
            signals.clone(),
            AxisLayout::new(1, 0),
        )
        .spawn(shutdown.clone());

        device.write_all(b"getrobotname,KR6;getcurrent").await.unwrap();
        device.write_all(b"joints,42.5;\r\n").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while state.joints().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.identity().name, "KR6");
        assert_eq!(state.joints(), vec![42.5]);

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
