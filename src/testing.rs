//! Scripted controller shared by the driver and stream tests

use crate::config::DriverConfig;
use crate::driver::EkiDriver;
use crate::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Answers each request the way the EKI server does
pub struct FakeDevice {
    program_status: &'static str,
    completes_motion: bool,
    requests: Option<mpsc::UnboundedSender<String>>,
}

impl FakeDevice {
    pub fn new(program_status: &'static str) -> Self {
        Self {
            program_status,
            completes_motion: true,
            requests: None,
        }
    }

    /// Echo `ptptojointpos` but never report success
    pub fn without_completion(mut self) -> Self {
        self.completes_motion = false;
        self
    }

    /// Forward every request line, terminator included
    pub fn recording(mut self, requests: mpsc::UnboundedSender<String>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub async fn serve<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        loop {
            let mut request = Vec::new();
            match reader.read_until(b';', &mut request).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let request = String::from_utf8_lossy(&request).to_string();
            if let Some(requests) = &self.requests {
                let _ = requests.send(request.clone());
            }
            let name = request.trim_end_matches(';').split(',').next().unwrap_or("");

            let reply = match name {
                "getrobotname" => "getrobotname,KR10 R1100-2;".to_string(),
                "getrobotserialnum" => "getrobotserialnum,940123;".to_string(),
                "getrobottype" => "getrobottype,KR10;".to_string(),
                "getsoftwareversion" => "getsoftwareversion,8.6.9;".to_string(),
                "getoperatingmode" => "getoperatingmode,T1;".to_string(),
                "getnegjntlim" => "getnegjntlim,-170,-190,-120,-185,-120,-350,0,0,0,0,0,0;".to_string(),
                "getposjntlim" => "getposjntlim,170,45,156,185,120,350,0,0,0,0,0,0;".to_string(),
                "getcurrentjoints" => "getcurrentjoints,0,-90,90,0,0,0,0,0,0,0,0,0;".to_string(),
                "getcurrentpos" => "getcurrentpos,500,0,800,0,1.57,0,2,35,0,0,0,0,0,0;".to_string(),
                "getprograminfo" => format!("getprograminfo,ekiMain,{};", self.program_status),
                "ptptojointpos" if self.completes_motion => format!("{}ptptojointpos,success;", request),
                "ptptojointpos" => request.clone(),
                "setstop" => "setstop,success;".to_string(),
                _ => continue,
            };
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

/// Short timeouts and no pacing
pub fn config(safe_mode: bool) -> DriverConfig {
    let mut config = DriverConfig::for_host("127.0.0.1");
    config.motion.safe_mode = Some(safe_mode);
    config.motion.timeout_secs = Some(2);
    config.motion.poll_interval_ms = Some(50);
    config.protocol.read_timeout_ms = Some(20);
    config.protocol.command_interval_ms = Some(0);
    config.protocol.program_state_timeout_ms = Some(500);
    config.protocol.bootstrap_timeout_secs = Some(2);
    config
}

/// Driver bootstrapped against `device` over an in-memory pipe
pub async fn connected_driver(device: FakeDevice, safe_mode: bool) -> Result<EkiDriver> {
    let (remote, host) = tokio::io::duplex(4096);
    tokio::spawn(device.serve(remote));

    let mut driver = EkiDriver::new(config(safe_mode))?;
    driver.connect_with(host).await?;
    Ok(driver)
}
