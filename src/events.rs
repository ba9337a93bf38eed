//! Status events and the sinks that receive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Event severity, ordered from clear to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Clear,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Clear => "clear",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Event classes emitted by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    /// Process up, missing and restarted
    OsProcess,
    /// Process table availability on the agent
    Snmp,
    /// Metric persistence
    Perf,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::OsProcess => "/Status/OSProcess",
            EventClass::Snmp => "/Status/Snmp",
            EventClass::Perf => "/Status/Perf",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_class: EventClass,
    pub device: String,
    pub summary: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_class: EventClass, device: &str, summary: impl Into<String>, severity: Severity) -> Self {
        Self {
            event_class,
            device: device.to_string(),
            summary: summary.into(),
            severity,
            message: None,
            component: None,
            event_key: None,
            event_group: None,
            dedup_id: None,
            agent: None,
            resolution: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.event_key = Some(key.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.event_group = Some(group.into());
        self
    }

    pub fn with_dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    /// Key under which repeated occurrences collapse into one alert.
    pub fn dedup_key(&self) -> String {
        if let Some(id) = &self.dedup_id {
            return id.clone();
        }
        format!(
            "{}|{}|{}|{}",
            self.device,
            self.component.as_deref().unwrap_or_default(),
            self.event_class,
            self.event_key.as_deref().unwrap_or_default()
        )
    }
}

/// Receiver of status events. Sending never fails from the caller's view.
pub trait EventSink: Send + Sync {
    fn send(&self, event: Event);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn send(&self, event: Event) {
        let key = event.dedup_key();
        match event.severity {
            Severity::Critical | Severity::Error => {
                error!("[{}] {} ({})", event.event_class, event.summary, key)
            }
            Severity::Warning => warn!("[{}] {} ({})", event.event_class, event.summary, key),
            Severity::Info => info!("[{}] {} ({})", event.event_class, event.summary, key),
            Severity::Clear | Severity::Debug => {
                debug!("[{}] {} ({})", event.event_class, event.summary, key)
            }
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns and forgets the recorded events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingEventSink {
    fn send(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
