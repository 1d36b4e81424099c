//! EKI - control and telemetry client for EKI-connected robot arms
//!
//! Talks to the controller's EKI server program over a single TCP socket
//! using its comma-separated, `;`-terminated text protocol. Responses carry
//! no request identifiers, so a background monitor routes each one onto a
//! shared state store by its leading command token.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eki::{DriverConfig, EkiDriver, MotionOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut driver = EkiDriver::new(DriverConfig::for_host("192.168.1.147"))?;
//!     driver.connect().await?;
//!
//!     println!("Connected to {}", driver.device_identity().name);
//!
//!     let outcome = driver
//!         .move_to_joint_positions(&[0.0, -90.0, 90.0, 0.0, 0.0, 0.0])
//!         .await?;
//!     if outcome == MotionOutcome::TimedOut {
//!         println!("Robot did not report completion");
//!     }
//!
//!     driver.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Transport**: socket ownership, locked send/receive with a read deadline
//! - **Codec**: request encoding, response decoding and frame reassembly
//! - **StateStore**: device identity, limits, telemetry and motion flag
//! - **ResponseMonitor**: background demultiplexer from responses to state
//! - **MotionOrchestrator**: validated motion with completion tracking
//! - **EkiDriver**: session lifecycle and bootstrap
//! - **CommandStream**: newline command input for the CLI

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod json_output;
pub mod monitor;
pub mod motion;
pub mod state;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use codec::{AxisLayout, CommandKind, EkiCommand, FrameBuffer, Response};
pub use config::{DeviceConfig, DriverConfig, MotionConfig, ProtocolConfig};
pub use driver::EkiDriver;
pub use error::{EkiError, Result};
pub use monitor::{CompletionSignal, MonitorEvent, ResponseMonitor, SessionSignals, Telemetry};
pub use motion::{MotionOrchestrator, MotionOutcome};
pub use state::{DeviceIdentity, DeviceState, JointLimit, Pose, ProgramStatus, StateStore};
pub use stream::{CommandStream, StreamCommand};
pub use transport::{CommandSender, DeviceStream, Transport, TransportStats};
