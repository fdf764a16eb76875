//! Status event sinks for the daemon
//!
//! The coordinator reports through [`StatusReporter`]; the daemon picks one
//! of two sinks at startup. [`LogReporter`] turns events into tracing
//! records for human consumption, [`JsonLineReporter`] prints one JSON
//! object per line on stdout for supervising tools to consume.

use sideload_core::{EventKind, StatusEvent, StatusReporter};
use tracing::{info, warn};

/// Reports status events through the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, event: StatusEvent) {
        match event.kind {
            EventKind::DeviceFailed { .. } | EventKind::DeviceLost { .. } => {
                warn!("{}", event)
            }
            _ => info!("{}", event),
        }
    }
}

/// Reports status events as JSON lines on stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineReporter;

fn render(event: &StatusEvent) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(event)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "message".to_string(),
            serde_json::Value::String(event.to_string()),
        );
    }
    serde_json::to_string(&value)
}

impl StatusReporter for JsonLineReporter {
    fn report(&self, event: StatusEvent) {
        match render(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("failed to serialize status event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_line_carries_type_and_message() {
        let event = StatusEvent::now(EventKind::DeviceCompleted {
            device_id: "R58M123ABCD".to_string(),
            files_pushed: 3,
        });

        let line = render(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "deviceCompleted");
        assert_eq!(value["deviceId"], "R58M123ABCD");
        assert_eq!(value["filesPushed"], 3);
        assert!(value["message"].as_str().unwrap().contains("R58M123ABCD"));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_log_reporter_accepts_every_kind() {
        let reporter = LogReporter;
        reporter.report(StatusEvent::now(EventKind::RunStarted { staged_files: 2 }));
        reporter.report(StatusEvent::now(EventKind::DeviceFailed {
            device_id: "R58M123ABCD".to_string(),
            file: Some("a.jpg".to_string()),
            reason: "device disconnected".to_string(),
            file_percent: Some(40),
        }));
        reporter.report(StatusEvent::now(EventKind::RunStopped));
    }
}
