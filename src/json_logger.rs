//! Structured JSON logging for jq parsing
//!
//! This module provides JSON-formatted logging that can be easily parsed
//! with jq and other JSON tools for analysis and monitoring.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp (RFC3339)
    pub timestamp: String,

    /// Log level
    pub level: LogLevel,

    /// Component/module name
    pub component: String,

    /// Log message
    pub message: String,

    /// Additional structured data
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: humantime::format_rfc3339(SystemTime::now()).to_string(),
            level,
            component: component.into(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Add key-value pair to data
    pub fn add_field(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.data {
            map.insert(key.to_string(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), value);
            self.data = serde_json::Value::Object(map);
        }
        self
    }

    /// Output as JSON line
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}

/// JSON logger
pub struct JsonLogger;

impl JsonLogger {
    /// Log debug message
    pub fn debug(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Debug, component, message).emit();
    }

    /// Log debug with data
    pub fn debug_data(
        component: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        LogEntry::new(LogLevel::Debug, component, message)
            .with_data(data)
            .emit();
    }

    /// Log info message
    pub fn info(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Info, component, message).emit();
    }

    /// Log info with data
    pub fn info_data(
        component: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        LogEntry::new(LogLevel::Info, component, message)
            .with_data(data)
            .emit();
    }

    /// Log warning message
    pub fn warn(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Warn, component, message).emit();
    }

    /// Log warning with data
    pub fn warn_data(
        component: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        LogEntry::new(LogLevel::Warn, component, message)
            .with_data(data)
            .emit();
    }

    /// Log error message
    pub fn error(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Error, component, message).emit();
    }

    /// Log error with data
    pub fn error_data(
        component: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        LogEntry::new(LogLevel::Error, component, message)
            .with_data(data)
            .emit();
    }

    /// Log a peer connection (either direction, dialed or accepted).
    pub fn peer_connected(
        component: impl Into<String>,
        peer_id: &str,
        transport: &str,
        is_dialer: bool,
    ) {
        let data = serde_json::json!({
            "event_type": "peer_connected",
            "peer_id": peer_id,
            "transport": transport,
            "is_dialer": is_dialer,
        });

        LogEntry::new(LogLevel::Info, component, "Peer connected")
            .with_data(data)
            .emit();
    }

    /// Log a peer disconnect, with the reason the disconnect callback fired.
    pub fn peer_disconnected(component: impl Into<String>, peer_id: &str, reason: &str) {
        let data = serde_json::json!({
            "event_type": "peer_disconnected",
            "peer_id": peer_id,
            "reason": reason,
        });

        LogEntry::new(LogLevel::Warn, component, "Peer disconnected")
            .with_data(data)
            .emit();
    }

    /// Log a route accepted into the routing table (CIDR, domain, or tunnel).
    pub fn route_learned(
        component: impl Into<String>,
        kind: &str,
        origin: &str,
        target: &str,
        metric: u16,
        sequence: u32,
    ) {
        let data = serde_json::json!({
            "event_type": "route_learned",
            "kind": kind,
            "origin": origin,
            "target": target,
            "metric": metric,
            "sequence": sequence,
        });

        LogEntry::new(LogLevel::Debug, component, "Route learned")
            .with_data(data)
            .emit();
    }

    /// Log a stream being opened (ingress origination or exit acceptance).
    pub fn stream_opened(component: impl Into<String>, protocol: &str, remote: &str, stream_id: u64) {
        let data = serde_json::json!({
            "event_type": "stream_opened",
            "protocol": protocol,
            "remote": remote,
            "stream_id": stream_id,
        });

        LogEntry::new(LogLevel::Info, component, "Stream opened")
            .with_data(data)
            .emit();
    }

    /// Log a stream closing, with the reason (fin, reset, local error).
    pub fn stream_closed(component: impl Into<String>, protocol: &str, stream_id: u64, reason: &str) {
        let data = serde_json::json!({
            "event_type": "stream_closed",
            "protocol": protocol,
            "stream_id": stream_id,
            "reason": reason,
        });

        LogEntry::new(LogLevel::Debug, component, "Stream closed")
            .with_data(data)
            .emit();
    }
}

/// Macros for convenient JSON logging
#[macro_export]
macro_rules! jlog_debug {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::debug($component, $message)
    };
    ($component:expr, $message:expr, $data:expr) => {
        $crate::json_logger::JsonLogger::debug_data($component, $message, $data)
    };
}

#[macro_export]
macro_rules! jlog_info {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::info($component, $message)
    };
    ($component:expr, $message:expr, $data:expr) => {
        $crate::json_logger::JsonLogger::info_data($component, $message, $data)
    };
}

#[macro_export]
macro_rules! jlog_warn {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::warn($component, $message)
    };
    ($component:expr, $message:expr, $data:expr) => {
        $crate::json_logger::JsonLogger::warn_data($component, $message, $data)
    };
}

#[macro_export]
macro_rules! jlog_error {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::error($component, $message)
    };
    ($component:expr, $message:expr, $data:expr) => {
        $crate::json_logger::JsonLogger::error_data($component, $message, $data)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_creation() {
        let entry = LogEntry::new(LogLevel::Info, "test", "Test message");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, "test");
        assert_eq!(entry.message, "Test message");
    }

    #[test]
    fn test_log_entry_with_data() {
        let data = serde_json::json!({
            "key": "value",
            "number": 42
        });

        let entry = LogEntry::new(LogLevel::Debug, "test", "Test")
            .with_data(data.clone());

        assert_eq!(entry.data, data);
    }

    #[test]
    fn test_json_serialization() {
        let entry = LogEntry::new(LogLevel::Error, "network", "Connection failed")
            .add_field("port", serde_json::json!(443))
            .add_field("protocol", serde_json::json!("https"));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"level\":\"ERROR\""));
        assert!(json.contains("\"component\":\"network\""));
        assert!(json.contains("\"port\":443"));
    }
}
