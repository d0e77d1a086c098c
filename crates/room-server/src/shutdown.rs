//! Shutdown bookkeeping, mirroring the teacher's `ShutdownReason`/
//! `log_shutdown_stage` pattern so the final shutdown sequence logs the same
//! "begin"/"complete" pair regardless of why it started.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    ListenerClosed,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::CtrlC => "ctrl_c",
            ShutdownReason::ListenerClosed => "listener_closed",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn log_shutdown_stage(reason: ShutdownReason, stage: &'static str) {
    tracing::info!(target: "room.server.shutdown", reason = reason.as_str(), stage, "shutdown_stage");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_reason_as_str_matches_display() {
        assert_eq!(ShutdownReason::CtrlC.as_str(), "ctrl_c");
        assert_eq!(format!("{}", ShutdownReason::ListenerClosed), "listener_closed");
    }
}
