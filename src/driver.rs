//! Session facade for one EKI-connected arm
//!
//! Owns the transport, the state store and the background tasks. A session
//! moves through connect, bootstrap, operation and close; `reconnect` runs
//! the whole cycle again on a fresh socket.

use crate::codec::{AxisLayout, EkiCommand, FRAME_TERMINATORS};
use crate::config::DriverConfig;
use crate::monitor::{ResponseMonitor, SessionSignals};
use crate::motion::{MotionOrchestrator, MotionOutcome};
use crate::state::{DeviceIdentity, DeviceState, Pose, ProgramStatus, StateStore};
use crate::transport::{CommandSender, DeviceStream, Transport, TransportStats};
use crate::{EkiError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often bootstrap checks whether the state store is populated
const BOOTSTRAP_POLL: Duration = Duration::from_millis(50);

pub struct EkiDriver {
    config: DriverConfig,
    transport: Arc<Transport>,
    sender: CommandSender,
    state: Arc<StateStore>,
    signals: Arc<SessionSignals>,
    motion: MotionOrchestrator,
    shutdown: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl EkiDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(Transport::new(config.protocol.read_timeout()));
        let sender = CommandSender::new(transport.clone(), config.protocol.command_interval());
        let state = Arc::new(StateStore::new(config.motion.joint_count()));
        let signals = Arc::new(SessionSignals::default());
        // No session yet, so everything that checks the flag sees "closed"
        let shutdown = Arc::new(AtomicBool::new(true));

        let motion = MotionOrchestrator::new(
            sender.clone(),
            state.clone(),
            signals.clone(),
            config.motion.clone(),
            config.protocol.program_state_timeout(),
            shutdown.clone(),
        );

        Ok(Self {
            config,
            transport,
            sender,
            state,
            signals,
            motion,
            shutdown,
            monitor: None,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Dial the configured address, start the monitor and bootstrap
    pub async fn connect(&mut self) -> Result<()> {
        self.close().await?;

        let address = self.config.address();
        info!("Connecting to EKI server at {}", address);
        self.transport
            .connect(&address, self.config.device.connect_timeout())
            .await?;

        self.start_session().await
    }

    /// Run a session over an already open stream
    pub async fn connect_with<S: DeviceStream + 'static>(&mut self, stream: S) -> Result<()> {
        self.close().await?;
        self.transport.attach(stream).await?;
        self.start_session().await
    }

    async fn start_session(&mut self) -> Result<()> {
        self.shutdown.store(false, Ordering::Relaxed);

        let layout = AxisLayout::new(
            self.config.motion.joint_count(),
            self.config.motion.external_axes(),
        );
        let monitor = ResponseMonitor::new(
            self.transport.clone(),
            self.state.clone(),
            self.signals.clone(),
            layout,
        );
        self.monitor = Some(monitor.spawn(self.shutdown.clone()));

        if let Err(e) = self.bootstrap().await {
            error!("Bootstrap failed: {}", e);
            if let Err(close_err) = self.close().await {
                warn!("Failed to close session after bootstrap error: {}", close_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Request identity, limits and telemetry, then wait until the monitor
    /// has filled the state store and the remote program is checked
    async fn bootstrap(&self) -> Result<()> {
        info!("Requesting device information");
        for command in EkiCommand::DEVICE_INFO {
            self.sender.send::<&str>(command, &[]).await?;
        }
        self.sender.send::<&str>(EkiCommand::GetJointNegLimit, &[]).await?;
        self.sender.send::<&str>(EkiCommand::GetJointPosLimit, &[]).await?;
        self.update_state().await?;

        let timeout = self.config.protocol.bootstrap_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.state.is_populated() {
            if tokio::time::Instant::now() >= deadline {
                return Err(EkiError::Timeout(format!(
                    "device information after {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(BOOTSTRAP_POLL).await;
        }

        let identity = self.state.identity();
        info!(
            "Device ready: {} ({}, serial {}, software {}, mode {})",
            identity.name,
            identity.robot_type,
            identity.serial_number,
            identity.software_version,
            identity.operating_mode
        );

        self.check_program().await
    }

    async fn check_program(&self) -> Result<()> {
        let safe_mode = self.config.motion.safe_mode();
        match self.motion.query_program_status().await {
            Ok(ProgramStatus::Running) => {
                info!("Remote program is running");
                Ok(())
            }
            Ok(status) if safe_mode => Err(EkiError::UnsafeState(status)),
            Ok(status) => {
                warn!("Remote program is {}, motion may be rejected by the controller", status);
                Ok(())
            }
            Err(e) if safe_mode => Err(e),
            Err(e) => {
                warn!("Could not read remote program state: {}", e);
                Ok(())
            }
        }
    }

    /// Stop background tasks, release the socket and forget device state.
    /// Closing a session that is not open does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let monitor = match self.monitor.take() {
            Some(monitor) => monitor,
            None => return Ok(()),
        };

        info!("Closing session");
        self.shutdown.store(true, Ordering::Relaxed);
        monitor.await?;
        self.motion.join_watchers().await?;

        if self.transport.is_connected().await {
            self.transport.disconnect().await?;
        }
        self.state.reset();
        Ok(())
    }

    /// Stop any motion, drop the connection and bootstrap a new one
    pub async fn reconnect(&mut self) -> Result<()> {
        info!("Reconnecting");
        if self.monitor.is_some() && self.state.is_moving() {
            if let Err(e) = self.motion.stop().await {
                warn!("Failed to stop robot before reconnecting: {}", e);
            }
        }
        self.close().await?;
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.monitor.is_some()
    }

    pub async fn move_to_joint_positions(&self, target: &[f64]) -> Result<MotionOutcome> {
        self.motion.move_to_joint_positions(target).await
    }

    pub async fn move_through(&self, targets: &[Vec<f64>]) -> Result<Vec<MotionOutcome>> {
        self.motion.move_through(targets).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.motion.stop().await
    }

    /// Ask for fresh joint and pose telemetry
    pub async fn update_state(&self) -> Result<()> {
        self.ensure_open()?;
        self.motion.refresh_telemetry().await
    }

    /// Query the remote program and return its status once the answer lands
    pub async fn program_status(&self) -> Result<ProgramStatus> {
        self.ensure_open()?;
        self.motion.query_program_status().await
    }

    /// Write a command line unchanged except for a missing terminator
    pub async fn send_raw(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        let command = command.trim();
        if command.is_empty() {
            return Err(EkiError::parse("raw", "empty command"));
        }

        let ends_framed = command
            .as_bytes()
            .last()
            .map_or(false, |b| FRAME_TERMINATORS.contains(b));
        if ends_framed {
            self.sender.send_line(command).await
        } else {
            self.sender.send_line(&format!("{};", command)).await
        }
    }

    pub fn is_moving(&self) -> bool {
        self.state.is_moving()
    }

    pub fn joint_positions(&self) -> Vec<f64> {
        self.state.joints()
    }

    pub fn end_position(&self) -> Option<Pose> {
        self.state.end_effector_pose()
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        self.state.identity()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.snapshot()
    }

    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(EkiError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JointLimit;
    use crate::testing::{self, FakeDevice};
    use tokio::net::TcpListener;

    async fn connected_driver(program_status: &'static str, safe_mode: bool) -> Result<EkiDriver> {
        testing::connected_driver(FakeDevice::new(program_status), safe_mode).await
    }

    #[tokio::test]
    async fn test_bootstrap_populates_state() {
        let mut driver = connected_driver("Running", true).await.unwrap();

        let identity = driver.device_identity();
        assert_eq!(identity.name, "KR10 R1100-2");
        assert_eq!(identity.serial_number, "940123");
        assert_eq!(identity.operating_mode, "T1");

        let snapshot = driver.snapshot();
        assert_eq!(snapshot.joint_limits().unwrap()[1], JointLimit::new(-190.0, 45.0));
        assert_eq!(snapshot.program_status, ProgramStatus::Running);
        assert_eq!(snapshot.program_name, "ekiMain");
        assert_eq!(driver.joint_positions(), vec![0.0, -90.0, 90.0, 0.0, 0.0, 0.0]);

        // Telemetry refresh requested during bootstrap may land after readiness
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while driver.end_position().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(driver.end_position().map(|p| p.z), Some(800.0));

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_mode_bootstrap_requires_running_program() {
        let err = connected_driver("Stopped", true).await.err().unwrap();
        assert!(matches!(err, EkiError::UnsafeState(ProgramStatus::Stopped)));
    }

    #[tokio::test]
    async fn test_unsafe_program_only_warns_outside_safe_mode() {
        let mut driver = connected_driver("Ended", false).await.unwrap();
        assert_eq!(driver.snapshot().program_status, ProgramStatus::Ended);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_and_program_status_through_session() {
        let mut driver = connected_driver("Running", true).await.unwrap();

        let outcome = driver
            .move_to_joint_positions(&[0.0, -80.0, 80.0, 0.0, 10.0, 0.0])
            .await
            .unwrap();
        assert_eq!(outcome, MotionOutcome::Completed);
        assert!(!driver.is_moving());

        let outcomes = driver
            .move_through(&[vec![1.0, -80.0, 80.0, 0.0, 10.0, 0.0], vec![2.0, -80.0, 80.0, 0.0, 10.0, 0.0]])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![MotionOutcome::Completed, MotionOutcome::Completed]);

        assert_eq!(driver.program_status().await.unwrap(), ProgramStatus::Running);
        driver.stop().await.unwrap();
        driver.send_raw("getrobotname").await.unwrap();
        assert!(driver.stats().writes > 0);

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let mut driver = connected_driver("Running", false).await.unwrap();
        driver.close().await.unwrap();

        assert!(!driver.is_connected());
        assert!(driver.device_identity().name.is_empty());
        assert!(matches!(
            driver.move_to_joint_positions(&[0.0; 6]).await,
            Err(EkiError::Closed)
        ));
        assert!(matches!(driver.send_raw("setstop").await, Err(EkiError::Closed)));

        // A second close is a no-op
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_reconnect_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(FakeDevice::new("Running").serve(stream));
            }
        });

        let mut config = testing::config(false);
        config.device.port = Some(port);
        let mut driver = EkiDriver::new(config).unwrap();

        driver.connect().await.unwrap();
        assert_eq!(driver.device_identity().robot_type, "KR10");

        driver.reconnect().await.unwrap();
        assert!(driver.is_connected());
        assert_eq!(driver.device_identity().robot_type, "KR10");

        driver.close().await.unwrap();
    }
}
