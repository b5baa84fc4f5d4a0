use std::{fmt, time::Duration};

use serde::Serialize;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

use crate::config::Environment;

/// Error message a handler wants in the access log line for its request.
/// Attach it to the response extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage(pub String);

impl ErrorMessage {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorMessage(message.into())
    }
}

/// Layout of an access log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLogFormat {
    Json,
    Text,
}

impl From<Environment> for AccessLogFormat {
    fn from(env: Environment) -> Self {
        if env.is_production() {
            AccessLogFormat::Json
        } else {
            AccessLogFormat::Text
        }
    }
}

/// One served request. Field order is the order of the JSON keys.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub ts: String,
    pub method: String,
    pub path: String,
    pub code: u16,
    pub took: String,
    #[serde(rename = "reqId", skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessLogEntry {
    pub fn new(
        timer: &impl FormatTime,
        method: &str,
        path: &str,
        code: u16,
        took: Duration,
    ) -> Self {
        AccessLogEntry {
            ts: timestamp(timer),
            method: method.to_string(),
            path: path.to_string(),
            code,
            took: format_duration(took),
            req_id: None,
            error: None,
        }
    }

    pub fn with_req_id(mut self, req_id: Option<String>) -> Self {
        self.req_id = req_id;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// The line to write, without the trailing newline.
    pub fn format(&self, format: AccessLogFormat) -> String {
        match format {
            AccessLogFormat::Json => self.to_json(),
            AccessLogFormat::Text => self.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // only strings and integers, serialization can't fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:>3} | {:>10} | {:<7} {:?}",
            self.ts, self.code, self.took, self.method, self.path
        )?;
        if let Some(req_id) = &self.req_id {
            write!(f, " reqId={req_id}")?;
        }
        if let Some(error) = &self.error {
            write!(f, " error={error:?}")?;
        }
        Ok(())
    }
}

fn timestamp(timer: &impl FormatTime) -> String {
    let mut ts = String::new();
    if timer.format_time(&mut Writer::new(&mut ts)).is_err() {
        ts.clear();
    }
    ts
}

/// Short duration form: `5ms`, `1.5s`, `250µs`.
pub fn format_duration(duration: Duration) -> String {
    format!("{duration:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTime;

    impl FormatTime for FixedTime {
        fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
            w.write_str("2026-10-18T09:30:00.000000Z")
        }
    }

    fn entry() -> AccessLogEntry {
        AccessLogEntry::new(&FixedTime, "GET", "/foo", 200, Duration::from_millis(5))
    }

    #[test]
    fn json_line_has_fixed_field_order() {
        assert_eq!(
            entry().to_json(),
            r#"{"ts":"2026-10-18T09:30:00.000000Z","method":"GET","path":"/foo","code":200,"took":"5ms"}"#
        );
    }

    #[test]
    fn json_line_appends_request_id_then_error() {
        let line = entry()
            .with_req_id(Some("abc".to_string()))
            .with_error(Some("boom \"x\"".to_string()))
            .to_json();

        assert_eq!(
            line,
            r#"{"ts":"2026-10-18T09:30:00.000000Z","method":"GET","path":"/foo","code":200,"took":"5ms","reqId":"abc","error":"boom \"x\""}"#
        );
    }

    #[test]
    fn text_line() {
        let line = entry().with_req_id(Some("abc".to_string())).format(AccessLogFormat::Text);
        assert_eq!(
            line,
            r#"[2026-10-18T09:30:00.000000Z] 200 |        5ms | GET     "/foo" reqId=abc"#
        );
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
    }

    #[test]
    fn environment_picks_format() {
        assert_eq!(AccessLogFormat::from(Environment::Production), AccessLogFormat::Json);
        assert_eq!(AccessLogFormat::from(Environment::Development), AccessLogFormat::Text);
    }
}
