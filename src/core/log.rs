//! Structured log events emitted during pipeline runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    /// Infer a severity from inline markers in a tool's output line.
    /// Returns `None` when no marker is present (caller falls back to the
    /// stream default).
    pub fn from_markers(text: &str) -> Option<LogLevel> {
        if text.contains('❌') {
            Some(LogLevel::Error)
        } else if text.contains("⚠️") {
            Some(LogLevel::Warning)
        } else if text.contains('✅') {
            Some(LogLevel::Success)
        } else {
            None
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        };
        f.write_str(s)
    }
}

/// One ordered progress message tied to a run, and optionally a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub run_id: Uuid,

    /// Strictly increasing, gap-free per run
    pub sequence: u64,

    /// Step the message belongs to; `None` for run-level messages
    pub step: Option<String>,

    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_inference() {
        assert_eq!(LogLevel::from_markers("❌ build failed"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_markers("⚠️ skipping import"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_markers("✅ image built"), Some(LogLevel::Success));
        assert_eq!(LogLevel::from_markers("plain progress line"), None);
    }

    #[test]
    fn test_event_json_shape() {
        let event = LogEvent {
            run_id: Uuid::nil(),
            sequence: 7,
            step: Some("build".to_string()),
            level: LogLevel::Info,
            message: "building image".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["step"], "build");
        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "building image");
        assert!(json["timestamp"].is_string());
    }
}
