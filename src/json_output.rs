//! Cell events and their structured output
//!
//! Every accepted, rejected or failed operator action produces a timestamped
//! event. The console prints them either as human-readable lines or as one
//! JSON object per line for external tools.

use crate::orchestrator::CellState;
use crate::outcome::RunOutcome;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Event published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellEvent {
    Notice {
        timestamp: DateTime<Utc>,
        level: NoticeLevel,
        message: String,
    },
    StateChanged {
        timestamp: DateTime<Utc>,
        from: CellState,
        to: CellState,
    },
    RunRecorded {
        timestamp: DateTime<Utc>,
        outcome: RunOutcome,
    },
}

impl CellEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        CellEvent::Notice {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn state_changed(from: CellState, to: CellState) -> Self {
        CellEvent::StateChanged {
            timestamp: Utc::now(),
            from,
            to,
        }
    }

    pub fn run_recorded(outcome: RunOutcome) -> Self {
        CellEvent::RunRecorded {
            timestamp: Utc::now(),
            outcome,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CellEvent::Notice { timestamp, .. }
            | CellEvent::StateChanged { timestamp, .. }
            | CellEvent::RunRecorded { timestamp, .. } => *timestamp,
        }
    }

    /// Single human-readable line
    pub fn to_line(&self) -> String {
        let ts = self
            .timestamp()
            .with_timezone(&chrono::Local)
            .format("%y-%m-%d %H:%M:%S");
        match self {
            CellEvent::Notice { level, message, .. } => {
                let tag = match level {
                    NoticeLevel::Info => "INFO",
                    NoticeLevel::Warning => "WARN",
                    NoticeLevel::Error => "ERROR",
                };
                format!("{} {:5} {}", ts, tag, message)
            }
            CellEvent::StateChanged { from, to, .. } => {
                format!("{} STATE {} -> {}", ts, from, to)
            }
            CellEvent::RunRecorded { outcome, .. } => {
                format!(
                    "{} SAVED {} (ended {})",
                    ts,
                    outcome.encode_meta(),
                    outcome.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                )
            }
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Output an event in the selected format
pub fn emit(event: &CellEvent, json: bool) {
    if json {
        output_event(event);
    } else {
        println!("{}", event.to_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RunMode;

    #[test]
    fn test_notice_serializes_with_type_tag() {
        let event = CellEvent::notice(NoticeLevel::Warning, "Write a valid number (>=1).");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notice");
        assert_eq!(json["level"], "warning");
        assert_eq!(json["message"], "Write a valid number (>=1).");
    }

    #[test]
    fn test_state_change_line() {
        let event = CellEvent::state_changed(CellState::Ready, CellState::Running(RunMode::Batch));
        assert!(event.to_line().ends_with("STATE ready -> running(batch)"));
    }
}
