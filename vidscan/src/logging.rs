//! Logging setup and the in-memory recent log buffer.
//!
//! This module provides:
//! - Console output with local timezone timestamps
//! - Optional daily rolling log files
//! - A bounded buffer of recent events for status queries

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::DEFAULT_LOG_FILTER;
use crate::utils::fs;

/// Number of entries kept by [`RecentLogs`] by default.
pub const RECENT_LOG_CAPACITY: usize = 100;

const LOG_FILE_PREFIX: &str = "vidscan.log";

/// Formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// A captured log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Bounded ring of recent log events, shared between the logging layer and readers.
#[derive(Debug, Clone)]
pub struct RecentLogs {
    entries: Arc<Mutex<VecDeque<LogEvent>>>,
    capacity: usize,
}

impl Default for RecentLogs {
    fn default() -> Self {
        Self::new(RECENT_LOG_CAPACITY)
    }
}

impl RecentLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, event: LogEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEvent> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// A layer that records INFO and more severe events into this buffer.
    pub fn layer(&self) -> RecentLogsLayer {
        RecentLogsLayer { sink: self.clone() }
    }
}

/// Tracing layer feeding [`RecentLogs`].
pub struct RecentLogsLayer {
    sink: RecentLogs,
}

impl<S> Layer<S> for RecentLogsLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::INFO {
            return;
        }

        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));

        self.sink.push(LogEvent {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
        });
    }
}

/// Visitor to extract the message field from a tracing event.
struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        } else if self.0.is_empty() {
            *self.0 = format!("{}: {:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.0.is_empty() {
            *self.0 = value.to_string();
        }
    }
}

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// `EnvFilter` directive.
    pub filter: String,
    /// Directory for daily rolling files; console only when `None`.
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
    pub recent_capacity: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            ansi: true,
            recent_capacity: RECENT_LOG_CAPACITY,
        }
    }
}

/// Keeps logging alive. Dropping it flushes and stops the file writer.
pub struct LoggingHandle {
    pub recent: RecentLogs,
    _guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(options: &LoggingOptions) -> crate::Result<LoggingHandle> {
    let filter = EnvFilter::try_new(&options.filter).map_err(|e| {
        crate::Error::config(format!("invalid log filter {:?}: {}", options.filter, e))
    })?;

    let recent = RecentLogs::new(options.recent_capacity);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            fs::ensure_dir_all_sync_with_op("creating log directory", dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(options.ansi)
                .with_timer(LocalTimer),
        )
        .with(file_layer)
        .with(recent.layer())
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(LoggingHandle {
        recent,
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::Registry;

    #[test]
    fn ring_keeps_newest_entries() {
        let logs = RecentLogs::new(3);
        for i in 0..5 {
            logs.push(LogEvent {
                timestamp: Utc::now(),
                level: "INFO".to_string(),
                target: "vidscan".to_string(),
                message: format!("m{i}"),
            });
        }

        let messages: Vec<_> = logs.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["m4", "m3", "m2"]);
        assert_eq!(logs.recent(1)[0].message, "m4");
    }

    #[test]
    fn layer_captures_info_and_above() {
        let logs = RecentLogs::new(10);
        let subscriber = Registry::default().with(logs.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("hidden");
            tracing::info!(job_id = "j1", "Job admitted");
            tracing::warn!("Source file missing");
        });

        let recent = logs.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].level, "WARN");
        assert_eq!(recent[0].message, "Source file missing");
        assert_eq!(recent[1].message, "Job admitted");
    }

    #[test]
    fn default_options_use_default_filter() {
        let options = LoggingOptions::default();
        assert!(options.filter.contains("vidscan=info"));
        assert!(options.log_dir.is_none());
    }
}
