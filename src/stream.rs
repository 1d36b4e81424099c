//! Line-oriented command stream
//!
//! Reads newline-delimited commands, runs each one against the driver to
//! completion and reports the result as JSON on stdout. A failed command is
//! reported and the stream moves on to the next line.

use crate::driver::EkiDriver;
use crate::json_output::{output_event, ErrorEvent, MotionEvent, PoseEvent, StateEvent};
use crate::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

/// One parsed input line
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    /// `move a,b,c,...` in degrees
    Move(Vec<f64>),
    Stop,
    /// `@status`: full state snapshot
    Status,
    /// `@pose`: joints and Cartesian pose
    Pose,
    /// `@refresh`: request fresh telemetry
    Refresh,
    Reconnect,
    /// Anything else goes to the device unchanged
    Raw(String),
}

impl StreamCommand {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if let Some(sentinel) = line.strip_prefix('@') {
            return match sentinel {
                "status" => Ok(Some(StreamCommand::Status)),
                "pose" => Ok(Some(StreamCommand::Pose)),
                "refresh" => Ok(Some(StreamCommand::Refresh)),
                "reconnect" => Ok(Some(StreamCommand::Reconnect)),
                other => Err(format!("unknown sentinel command @{}", other)),
            };
        }

        if line == "stop" {
            return Ok(Some(StreamCommand::Stop));
        }

        if let Some(args) = line.strip_prefix("move") {
            if args.is_empty() || args.starts_with(char::is_whitespace) {
                return parse_joint_list(args).map(|target| Some(StreamCommand::Move(target)));
            }
        }

        Ok(Some(StreamCommand::Raw(line.to_string())))
    }
}

/// Parse joint values separated by commas and/or whitespace
pub fn parse_joint_list(text: &str) -> std::result::Result<Vec<f64>, String> {
    let values = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| format!("invalid joint value '{}'", token))
        })
        .collect::<std::result::Result<Vec<f64>, String>>()?;

    if values.is_empty() {
        return Err("move needs at least one joint value".to_string());
    }
    Ok(values)
}

pub struct CommandStream {
    driver: EkiDriver,
    shutdown_signal: Arc<AtomicBool>,
    commands_processed: u32,
}

impl CommandStream {
    pub fn new(driver: EkiDriver, shutdown_signal: Arc<AtomicBool>) -> Self {
        Self {
            driver,
            shutdown_signal,
            commands_processed: 0,
        }
    }

    pub fn commands_processed(&self) -> u32 {
        self.commands_processed
    }

    pub fn driver(&self) -> &EkiDriver {
        &self.driver
    }

    /// Process lines until end of input, Ctrl+C or the shutdown signal.
    /// Ctrl+C stops the robot before returning, even mid-motion.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, reader: R) -> Result<()> {
        self.run_until(reader, tokio::signal::ctrl_c()).await
    }

    /// Same as `run`, ending on `interrupt` instead of Ctrl+C. The interrupt
    /// is raced against both the input read and the running command.
    pub async fn run_until<R, F>(&mut self, mut reader: R, interrupt: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future,
    {
        info!("Command stream active, one command per line");
        tokio::pin!(interrupt);

        let mut buffer = String::new();
        loop {
            if self.shutdown_signal.load(Ordering::Relaxed) {
                break;
            }
            buffer.clear();

            let interrupted = tokio::select! {
                line = reader.read_line(&mut buffer) => {
                    match line {
                        Ok(0) => {
                            info!("End of input reached");
                            break;
                        }
                        Ok(_) => {
                            let line = buffer.trim().to_string();
                            tokio::select! {
                                _ = self.handle_line(&line) => false,
                                _ = &mut interrupt => true,
                            }
                        }
                        Err(e) => {
                            error!("Failed to read command input: {}", e);
                            break;
                        }
                    }
                }
                _ = &mut interrupt => true,
            };

            if interrupted {
                self.stop_on_interrupt().await;
                break;
            }
        }

        Ok(())
    }

    async fn stop_on_interrupt(&self) {
        info!("Interrupted, stopping robot");
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Err(e) = self.driver.stop().await {
            error!("Failed to stop robot: {}", e);
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let command = match StreamCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                warn!("Skipping line: {}", e);
                output_event(&ErrorEvent::new(&e));
                return;
            }
        };

        if let Err(e) = self.execute(command).await {
            error!("Command failed: {}", e);
            output_event(&ErrorEvent::new(&e.to_string()));
        }
        self.commands_processed += 1;
    }

    /// Run one command. Motion results are reported here, so a motion
    /// failure is not returned as an error.
    pub async fn execute(&mut self, command: StreamCommand) -> Result<()> {
        match command {
            StreamCommand::Move(target) => {
                output_event(&MotionEvent::started(&target));
                match self.driver.move_to_joint_positions(&target).await {
                    Ok(outcome) => output_event(&MotionEvent::finished(&target, outcome)),
                    Err(e) => output_event(&MotionEvent::error(&target, &e)),
                }
                Ok(())
            }
            StreamCommand::Stop => self.driver.stop().await,
            StreamCommand::Status => {
                output_event(&self.state_event());
                Ok(())
            }
            StreamCommand::Pose => {
                output_event(&PoseEvent::from(self.state_event()));
                Ok(())
            }
            StreamCommand::Refresh => self.driver.update_state().await,
            StreamCommand::Reconnect => self.driver.reconnect().await,
            StreamCommand::Raw(line) => self.driver.send_raw(&line).await,
        }
    }

    fn state_event(&self) -> StateEvent {
        let decimal_places = self.driver.config().motion.decimal_places();
        StateEvent::from_state(&self.driver.snapshot(), decimal_places)
            .with_traffic(self.driver.stats())
    }

    /// Close the driver session
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Processed {} commands", self.commands_processed);
        self.driver.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::testing::{self, FakeDevice};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_sentinels_and_stop() {
        assert_eq!(StreamCommand::parse("@status"), Ok(Some(StreamCommand::Status)));
        assert_eq!(StreamCommand::parse("  @pose "), Ok(Some(StreamCommand::Pose)));
        assert_eq!(StreamCommand::parse("@refresh"), Ok(Some(StreamCommand::Refresh)));
        assert_eq!(StreamCommand::parse("@reconnect"), Ok(Some(StreamCommand::Reconnect)));
        assert_eq!(StreamCommand::parse("stop"), Ok(Some(StreamCommand::Stop)));
        assert!(StreamCommand::parse("@dance").is_err());
    }

    #[test]
    fn test_parse_move_targets() {
        assert_eq!(
            StreamCommand::parse("move 0,-90, 90 0 0 0"),
            Ok(Some(StreamCommand::Move(vec![0.0, -90.0, 90.0, 0.0, 0.0, 0.0])))
        );
        assert!(StreamCommand::parse("move 1,two,3").is_err());
        assert!(StreamCommand::parse("move  ").is_err());
    }

    #[test]
    fn test_parse_skips_blank_and_comments_and_passes_raw() {
        assert_eq!(StreamCommand::parse(""), Ok(None));
        assert_eq!(StreamCommand::parse("# home pose"), Ok(None));
        assert_eq!(
            StreamCommand::parse("getprograminfo;"),
            Ok(Some(StreamCommand::Raw("getprograminfo;".to_string())))
        );
    }

    #[tokio::test]
    async fn test_failed_commands_do_not_end_the_stream() {
        let driver = EkiDriver::new(DriverConfig::for_host("127.0.0.1")).unwrap();
        let mut stream = CommandStream::new(driver, Arc::new(AtomicBool::new(false)));

        let input: &[u8] = b"@status\nstop\n# comment\nmove 1,2,3,4,5,6\n@bogus\n";
        stream.run(input).await.unwrap();

        // Comment and bogus sentinel are not counted
        assert_eq!(stream.commands_processed(), 3);
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_during_motion_stops_robot() {
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        let device = FakeDevice::new("Running").without_completion().recording(requests_tx);
        let driver = testing::connected_driver(device, false).await.unwrap();
        let mut stream = CommandStream::new(driver, Arc::new(AtomicBool::new(false)));

        let input: &[u8] = b"move 0,-80,80,0,10,0\n";
        let interrupt = tokio::time::sleep(Duration::from_millis(300));
        tokio::time::timeout(Duration::from_secs(1), stream.run_until(input, interrupt))
            .await
            .expect("interrupt should end the pending motion")
            .unwrap();
        assert!(!stream.driver().is_moving());

        // setstop follows the motion command on the wire
        let mut motion_sent = false;
        tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(request) = requests.recv().await {
                if request.starts_with("ptptojointpos,") {
                    motion_sent = true;
                }
                if request == "setstop;" {
                    break;
                }
            }
        })
        .await
        .expect("setstop was never sent");
        assert!(motion_sent);

        stream.shutdown().await.unwrap();
    }
}
