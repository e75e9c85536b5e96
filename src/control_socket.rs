//! Control socket: a local Unix domain socket for operational queries
//! (spec.md §6). Deliberately much simpler than the connection manager — one
//! blocking `accept()` loop, one thread per connection, single line in,
//! single line reply, connection closed.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::client_table::ClientTable;
use crate::error::GatewayError;
use crate::log_sink::{LogEvent, LogSink};
use crate::storage::RetryQueueStats;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs the control socket's accept loop on the calling thread until
/// `terminate` is set. Intended to be spawned on its own thread by the
/// orchestrator.
pub struct ControlSocket {
    path: PathBuf,
    client_table: Arc<ClientTable>,
    retry_queue_stats: Arc<RetryQueueStats>,
    log_sink: Arc<dyn LogSink>,
    terminate: Arc<AtomicBool>,
}

impl ControlSocket {
    pub fn new(
        path: PathBuf,
        client_table: Arc<ClientTable>,
        retry_queue_stats: Arc<RetryQueueStats>,
        log_sink: Arc<dyn LogSink>,
        terminate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            path,
            client_table,
            retry_queue_stats,
            log_sink,
            terminate,
        }
    }

    fn bind(&self) -> Result<UnixListener, GatewayError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(GatewayError::Io)?;
        }
        let listener = UnixListener::bind(&self.path).map_err(GatewayError::Io)?;
        listener.set_nonblocking(true).map_err(GatewayError::Io)?;
        Ok(listener)
    }

    pub fn run(self) {
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.log_sink.emit(LogEvent::Error(format!(
                    "control socket failed to bind {}: {e}",
                    self.path.display()
                )));
                return;
            }
        };

        while !self.terminate.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let table = self.client_table.clone();
                    let retry_stats = self.retry_queue_stats.clone();
                    let sink = self.log_sink.clone();
                    thread::spawn(move || handle_connection(stream, &table, &retry_stats, sink.as_ref()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    self.log_sink.emit(LogEvent::Error(format!("control socket accept failed: {e}")));
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_connection(
    stream: UnixStream,
    client_table: &ClientTable,
    retry_queue_stats: &RetryQueueStats,
    log_sink: &dyn LogSink,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log_sink.emit(LogEvent::Warning(format!("control socket: failed to clone stream: {e}")));
            return;
        }
    });
    let mut writer = stream;

    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }

    let reply = dispatch(line.trim(), client_table, retry_queue_stats);
    let _ = writer.write_all(reply.as_bytes());
}

fn dispatch(command: &str, client_table: &ClientTable, retry_queue_stats: &RetryQueueStats) -> String {
    match command {
        "status" => format!("active_connections={}\n", client_table.active_connection_count()),
        "stats" => {
            let mut out = client_table.format_connection_snapshot();
            out.push_str(&retry_queue_summary(retry_queue_stats));
            out
        }
        other => format!("unknown command: {other:?}\n"),
    }
}

/// Renders a `stats`-style line for the retry queue, appended alongside the
/// client table's own snapshot, so an operator can see how close the
/// storage worker is to dropping readings (SPEC_FULL.md §8
/// resource-exhaustion accounting).
fn retry_queue_summary(stats: &RetryQueueStats) -> String {
    format!(
        "retry_queue_len={} retry_queue_high_water_mark={}\n",
        stats.len(),
        stats.high_water_mark()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::NullLogSink;
    use std::io::{Read as _, Write as _};
    use tempfile::tempdir;

    #[test]
    fn status_reports_active_connections() {
        let table = ClientTable::new(10, 10);
        table.try_admit(1, "10.0.0.1".into(), 1000, 0);
        let retry_stats = RetryQueueStats::default();
        assert_eq!(dispatch("status", &table, &retry_stats), "active_connections=1\n");
    }

    #[test]
    fn stats_includes_retry_queue_summary() {
        let table = ClientTable::new(10, 10);
        let retry_stats = RetryQueueStats::default();
        retry_stats.update(3);
        let out = dispatch("stats", &table, &retry_stats);
        assert!(out.contains("retry_queue_len=3"));
        assert!(out.contains("retry_queue_high_water_mark=3"));
    }

    #[test]
    fn unknown_command_is_reported_without_panicking() {
        let table = ClientTable::new(10, 10);
        let retry_stats = RetryQueueStats::default();
        assert_eq!(dispatch("bogus", &table, &retry_stats), "unknown command: \"bogus\"\n");
    }

    #[test]
    fn accepts_and_answers_one_connection_end_to_end() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("control.sock");
        let table = Arc::new(ClientTable::new(10, 10));
        let retry_stats = Arc::new(RetryQueueStats::default());
        let terminate = Arc::new(AtomicBool::new(false));
        let control = ControlSocket::new(
            sock_path.clone(),
            table,
            retry_stats,
            Arc::new(NullLogSink),
            terminate.clone(),
        );

        let handle = thread::spawn(move || control.run());
        thread::sleep(Duration::from_millis(100));

        let mut stream = UnixStream::connect(&sock_path).unwrap();
        stream.write_all(b"status\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert_eq!(response, "active_connections=0\n");

        terminate.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
