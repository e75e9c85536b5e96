//! Log sink collaborator (spec.md §6): a handle passed by reference rather
//! than a module-level singleton, per spec.md §9 DESIGN NOTES. Delivery is
//! best-effort; loss does not affect ingestion correctness.

use chrono::Utc;
use log::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum LogEvent {
    Fatal(String),
    Error(String),
    Warning(String),
    Info(String),
    Debug(String),
}

/// Implemented by anything that can receive gateway events. The default
/// implementation forwards to the `log` crate so it composes with whatever
/// backend (`env_logger` here) the binary installs.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Forwards every event to `log::{error,warn,info,debug}!`, prefixing
/// `Fatal` events distinctly since `log` has no FATAL level of its own.
pub struct StdLogSink;

impl LogSink for StdLogSink {
    fn emit(&self, event: LogEvent) {
        let now = Utc::now().to_rfc3339();
        match event {
            LogEvent::Fatal(msg) => error!("[{now}] FATAL: {msg}"),
            LogEvent::Error(msg) => error!("[{now}] {msg}"),
            LogEvent::Warning(msg) => warn!("[{now}] {msg}"),
            LogEvent::Info(msg) => info!("[{now}] {msg}"),
            LogEvent::Debug(msg) => debug!("[{now}] {msg}"),
        }
    }
}

/// Discards every event. Used in tests that only care about side effects
/// other than logging.
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn emit(&self, _event: LogEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn std_log_sink_does_not_panic_on_any_variant() {
        let sink = StdLogSink;
        sink.emit(LogEvent::Fatal("x".into()));
        sink.emit(LogEvent::Error("x".into()));
        sink.emit(LogEvent::Warning("x".into()));
        sink.emit(LogEvent::Info("x".into()));
        sink.emit(LogEvent::Debug("x".into()));
    }

    #[test]
    fn custom_sink_receives_events() {
        struct CountingSink(AtomicUsize);
        impl LogSink for CountingSink {
            fn emit(&self, _event: LogEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let sink = CountingSink(AtomicUsize::new(0));
        sink.emit(LogEvent::Info("hello".into()));
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }
}
