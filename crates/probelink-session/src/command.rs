use std::str::FromStr;

use crate::error::SessionError;

/// External commands accepted by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    StartSession,
    StopSession,
}

impl FromStr for SessionCommand {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "start" | "start_session" => Ok(SessionCommand::StartSession),
            "stop" | "stop_session" => Ok(SessionCommand::StopSession),
            _ => Err(SessionError::InvalidCommand(s.to_string())),
        }
    }
}
