//! EKI wire codec
//!
//! Requests are `<command>[,<arg>...];`. Responses echo the command name as
//! their first token followed by comma-separated values and one terminator
//! byte. There is no correlation ID: a response belongs to whichever request
//! carried the same leading token.

use std::fmt;
use std::str::FromStr;

/// Bytes that end a response frame on the wire
pub const FRAME_TERMINATORS: &[u8] = b";\n\r";

/// Upper bound for an unterminated frame before it is thrown away
pub const MAX_PENDING_FRAME: usize = 8192;

/// Status token the device sends when an action finishes
pub const SUCCESS_TOKEN: &str = "success";

/// Command vocabulary understood by the EKI server program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EkiCommand {
    GetRobotName,
    GetSoftwareVersion,
    GetRobotSerialNum,
    GetRobotType,
    GetOperatingMode,
    GetProgramInfo,
    GetJointPosLimit,
    GetJointNegLimit,
    GetEndPosition,
    GetJointPosition,
    SetJointPosition,
    SetStop,
}

/// Whether a command only reads data or has a side effect on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Query,
    Action,
}

impl EkiCommand {
    pub const ALL: [EkiCommand; 12] = [
        EkiCommand::GetRobotName,
        EkiCommand::GetSoftwareVersion,
        EkiCommand::GetRobotSerialNum,
        EkiCommand::GetRobotType,
        EkiCommand::GetOperatingMode,
        EkiCommand::GetProgramInfo,
        EkiCommand::GetJointPosLimit,
        EkiCommand::GetJointNegLimit,
        EkiCommand::GetEndPosition,
        EkiCommand::GetJointPosition,
        EkiCommand::SetJointPosition,
        EkiCommand::SetStop,
    ];

    /// Identity queries issued during bootstrap, in order
    pub const DEVICE_INFO: [EkiCommand; 5] = [
        EkiCommand::GetRobotName,
        EkiCommand::GetRobotSerialNum,
        EkiCommand::GetRobotType,
        EkiCommand::GetSoftwareVersion,
        EkiCommand::GetOperatingMode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EkiCommand::GetRobotName => "getrobotname",
            EkiCommand::GetSoftwareVersion => "getsoftwareversion",
            EkiCommand::GetRobotSerialNum => "getrobotserialnum",
            EkiCommand::GetRobotType => "getrobottype",
            EkiCommand::GetOperatingMode => "getoperatingmode",
            EkiCommand::GetProgramInfo => "getprograminfo",
            EkiCommand::GetJointPosLimit => "getposjntlim",
            EkiCommand::GetJointNegLimit => "getnegjntlim",
            EkiCommand::GetEndPosition => "getcurrentpos",
            EkiCommand::GetJointPosition => "getcurrentjoints",
            EkiCommand::SetJointPosition => "ptptojointpos",
            EkiCommand::SetStop => "setstop",
        }
    }

    pub fn kind(self) -> CommandKind {
        match self {
            EkiCommand::SetJointPosition | EkiCommand::SetStop => CommandKind::Action,
            _ => CommandKind::Query,
        }
    }

    /// Encode this command with positional arguments
    pub fn encode<S: AsRef<str>>(self, args: &[S]) -> String {
        encode(self.as_str(), &join_args(args))
    }
}

impl fmt::Display for EkiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EkiCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EkiCommand::ALL
            .iter()
            .copied()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| format!("unknown EKI command: {}", s))
    }
}

/// How many joint and external axis values a vector message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLayout {
    pub joints: usize,
    pub external: usize,
}

impl AxisLayout {
    pub fn new(joints: usize, external: usize) -> Self {
        Self { joints, external }
    }

    /// Values on the wire: joints first, external axes after
    pub fn width(&self) -> usize {
        self.joints + self.external
    }
}

/// Format a request line. Arguments are not escaped and must not contain
/// `,` or `;`.
pub fn encode(command: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{};", command)
    } else {
        format!("{},{};", command, args)
    }
}

fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(",")
}

/// A response line split into discriminator and positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub discriminator: String,
    pub args: Vec<String>,
}

impl Response {
    /// True when the device reports an action as finished
    pub fn is_success(&self) -> bool {
        self.args.first().map(String::as_str) == Some(SUCCESS_TOKEN)
    }

    pub fn command(&self) -> Option<EkiCommand> {
        self.discriminator.parse().ok()
    }
}

/// Decode one raw response frame. The final byte is the frame terminator
/// and is dropped before splitting.
pub fn decode(raw: &[u8]) -> Response {
    let body = match raw.split_last() {
        Some((_, rest)) => rest,
        None => raw,
    };
    let text = String::from_utf8_lossy(body);
    let mut tokens = text.split(',').map(|t| t.trim().to_string());

    Response {
        discriminator: tokens.next().unwrap_or_default(),
        args: tokens.collect(),
    }
}

/// Reassembles response frames from arbitrary socket reads
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete frame, terminator included
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            self.pending.push(byte);
            if FRAME_TERMINATORS.contains(&byte) {
                let frame = std::mem::take(&mut self.pending);
                // "\r\n" style endings leave a lone terminator behind
                if frame.len() > 1 {
                    frames.push(frame);
                }
            }
        }

        if self.pending.len() > MAX_PENDING_FRAME {
            tracing::warn!(
                "Discarding {} bytes of unterminated response data",
                self.pending.len()
            );
            self.pending.clear();
        }

        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_without_arguments() {
        assert_eq!(EkiCommand::GetRobotName.encode::<&str>(&[]), "getrobotname;");
        assert_eq!(encode("setstop", ""), "setstop;");
    }

    #[test]
    fn test_encode_with_arguments() {
        let args = ["1", "2", "3", "4", "5", "6", "0", "0", "0", "0", "0", "0"];
        assert_eq!(
            EkiCommand::SetJointPosition.encode(&args),
            "ptptojointpos,1,2,3,4,5,6,0,0,0,0,0,0;"
        );
    }

    #[test]
    fn test_motion_echo_recovers_command_name() {
        let args = ["1", "2", "3", "4", "5", "6", "0", "0", "0", "0", "0", "0"];
        let line = EkiCommand::SetJointPosition.encode(&args);

        let response = decode(line.as_bytes());
        assert_eq!(response.discriminator, "ptptojointpos");
        assert_eq!(response.command(), Some(EkiCommand::SetJointPosition));
        assert_eq!(response.args, args);
    }

    #[test]
    fn test_decode_trims_only_last_byte() {
        let response = decode(b"getrobotname,KR10;");
        assert_eq!(response.discriminator, "getrobotname");
        assert_eq!(response.args, vec!["KR10".to_string()]);

        let response = decode(b"getrobotname\n");
        assert_eq!(response.discriminator, "getrobotname");
        assert!(response.args.is_empty());
    }

    #[test]
    fn test_decode_empty_frame() {
        let response = decode(b"");
        assert_eq!(response.discriminator, "");
        assert!(response.args.is_empty());
    }

    #[test]
    fn test_success_detection_uses_first_argument() {
        assert!(decode(b"ptptojointpos,success;").is_success());
        assert!(decode(b"setstop,success;").is_success());
        assert!(!decode(b"success;").is_success());
        assert!(!decode(b"ptptojointpos,robotbusy;").is_success());
    }

    #[test]
    fn test_command_names_parse_back() {
        for command in EkiCommand::ALL {
            assert_eq!(command.as_str().parse::<EkiCommand>(), Ok(command));
        }
        assert!("getnothing".parse::<EkiCommand>().is_err());
        assert_eq!(EkiCommand::SetStop.kind(), CommandKind::Action);
        assert_eq!(EkiCommand::GetProgramInfo.kind(), CommandKind::Query);
    }

    #[test]
    fn test_frame_buffer_splits_and_reassembles() {
        let mut buffer = FrameBuffer::new();

        let frames = buffer.push(b"getrobotname,KR10;getrobottype,KR");
        assert_eq!(frames, vec![b"getrobotname,KR10;".to_vec()]);
        assert_eq!(buffer.pending_len(), "getrobottype,KR".len());

        let frames = buffer.push(b"10 R900\r\n");
        assert_eq!(frames, vec![b"getrobottype,KR10 R900\r".to_vec()]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_frame_buffer_drops_oversized_garbage() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&vec![b'x'; MAX_PENDING_FRAME + 1]);
        assert!(frames.is_empty());
        assert_eq!(buffer.pending_len(), 0);
    }
}
