//! Storage worker (C5): persists readings to SQLite, with a bounded local
//! retry queue and reconnect-with-backoff policy.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::error::GatewayError;
use crate::log_sink::{LogEvent, LogSink};
use crate::staging_buffer::StagingBuffer;
use crate::wire::SensorReading;

pub const RETRY_QUEUE_CAPACITY: usize = 20;

/// A reading held in the retry queue, plus the number of persistence
/// attempts made so far. The attempt counter is purely for observability
/// (SPEC_FULL.md §8) — it does not change the drop-oldest policy or impose
/// a cap.
#[derive(Debug, Clone, Copy)]
struct RetryItem {
    reading: SensorReading,
    attempts: u32,
}

/// Bounded circular queue, owned exclusively by the storage worker.
/// Overflow policy: drop-oldest (SW1).
struct RetryQueue {
    items: VecDeque<RetryItem>,
    capacity: usize,
    high_water_mark: usize,
}

impl RetryQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            high_water_mark: 0,
        }
    }

    fn push(&mut self, reading: SensorReading, log_sink: &dyn LogSink) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
            log_sink.emit(LogEvent::Warning(format!(
                "retry queue full (capacity {}), dropping oldest pending reading",
                self.capacity
            )));
        }
        self.items.push_back(RetryItem { reading, attempts: 0 });
        self.high_water_mark = self.high_water_mark.max(self.items.len());
    }

    fn peek_mut(&mut self) -> Option<&mut RetryItem> {
        self.items.front_mut()
    }

    fn pop(&mut self) {
        self.items.pop_front();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub connect_retry_attempts: u32,
    pub connect_retry_delay: Duration,
    pub retry_queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sensor_gateway.sqlite"),
            connect_retry_attempts: 3,
            connect_retry_delay: Duration::from_secs(5),
            retry_queue_capacity: RETRY_QUEUE_CAPACITY,
        }
    }
}

fn open_and_migrate(path: &Path) -> Result<Connection, GatewayError> {
    let conn = Connection::open(path).map_err(|e| GatewayError::DbConnect(e.to_string()))?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS SensorData (
            RecordID INTEGER PRIMARY KEY AUTOINCREMENT,
            SensorID INTEGER NOT NULL,
            Timestamp INTEGER NOT NULL,
            Value REAL NOT NULL
        )",
        [],
    )
    .map_err(|e| GatewayError::DbConnect(e.to_string()))?;
    Ok(conn)
}

fn insert_reading(conn: &Connection, reading: &SensorReading) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO SensorData (SensorID, Timestamp, Value) VALUES (?1, ?2, ?3)",
        params![reading.id as i64, reading.timestamp, reading.value],
    )
    .map_err(|e| GatewayError::DbInsert(e.to_string()))?;
    Ok(())
}

/// Sleeps in short slices so an interrupt (shutdown) can cut a long backoff
/// short, per spec.md §9 DESIGN NOTES ("interruptible sleeps poll it
/// between short sleeps").
fn interruptible_sleep(total: Duration, terminate: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if terminate.load(Ordering::SeqCst) {
            return;
        }
        let slice = remaining.min(SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

/// Attempt to (re)connect with up to `attempts` tries, `delay` between each.
/// Returns `Ok(None)` if shutdown was requested mid-backoff, `Ok(Some(conn))`
/// on success, `Err` once every attempt has failed.
fn connect_with_retry(
    config: &StorageConfig,
    terminate: &AtomicBool,
    log_sink: &dyn LogSink,
) -> Result<Option<Connection>, GatewayError> {
    let mut last_err = None;
    for attempt in 1..=config.connect_retry_attempts {
        if terminate.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match open_and_migrate(&config.db_path) {
            Ok(conn) => return Ok(Some(conn)),
            Err(e) => {
                log_sink.emit(LogEvent::Warning(format!(
                    "database connect attempt {attempt}/{} failed: {e}",
                    config.connect_retry_attempts
                )));
                last_err = Some(e);
                if attempt < config.connect_retry_attempts {
                    interruptible_sleep(config.connect_retry_delay, terminate);
                }
            }
        }
    }
    Err(last_err.unwrap_or(GatewayError::DbConnect("no attempts made".into())))
}

/// Shared, lock-free view of the retry queue's size for observers outside
/// the storage worker's own thread (the control socket's `stats` command).
/// `StorageWorker` owns the only writer; any number of readers may clone
/// this handle cheaply.
#[derive(Default)]
pub struct RetryQueueStats {
    len: AtomicUsize,
    high_water_mark: AtomicUsize,
}

impl RetryQueueStats {
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::SeqCst)
    }

    pub(crate) fn update(&self, len: usize) {
        self.len.store(len, Ordering::SeqCst);
        self.high_water_mark.fetch_max(len, Ordering::SeqCst);
    }
}

pub struct StorageWorker {
    config: StorageConfig,
    retry_queue: RetryQueue,
    log_sink: Arc<dyn LogSink>,
    terminate: Arc<AtomicBool>,
    stats: Arc<RetryQueueStats>,
}

impl StorageWorker {
    pub fn new(
        config: StorageConfig,
        log_sink: Arc<dyn LogSink>,
        terminate: Arc<AtomicBool>,
        stats: Arc<RetryQueueStats>,
    ) -> Self {
        let capacity = config.retry_queue_capacity;
        Self {
            config,
            retry_queue: RetryQueue::new(capacity),
            log_sink,
            terminate,
            stats,
        }
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    pub fn retry_queue_high_water_mark(&self) -> usize {
        self.retry_queue.high_water_mark
    }

    /// Runs the steady-state loop until the staging buffer reports shutdown.
    /// `terminate` is only ever set by this worker itself, to escalate a
    /// fatal reconnect exhaustion to the orchestrator — it is not consulted
    /// as a loop cutoff, so an orderly shutdown (buffer shutdown asserted
    /// after `terminate`) still drains every pending reading, matching the
    /// analytics worker's drain-to-completion behavior.
    pub fn run(mut self, buffer: Arc<StagingBuffer<SensorReading>>) {
        let mut conn = match connect_with_retry(&self.config, &self.terminate, self.log_sink.as_ref()) {
            Ok(Some(conn)) => conn,
            Ok(None) => return, // shutdown during initial connect
            Err(e) => {
                self.log_sink.emit(LogEvent::Fatal(format!(
                    "storage worker could not reach the database after {} attempts: {e}",
                    self.config.connect_retry_attempts
                )));
                self.terminate.store(true, Ordering::SeqCst);
                return;
            }
        };

        loop {
            let (current, from_retry) = if !self.retry_queue.is_empty() {
                let reading = self.retry_queue.peek_mut().expect("checked non-empty").reading;
                (reading, true)
            } else {
                match buffer.remove() {
                    Ok(reading) => (reading, false),
                    Err(_) => break,
                }
            };

            match insert_reading(&conn, &current) {
                Ok(()) => {
                    if from_retry {
                        self.retry_queue.pop();
                        self.stats.update(self.retry_queue.len());
                    }
                }
                Err(e) => {
                    self.log_sink.emit(LogEvent::Warning(format!(
                        "insert failed, connection considered lost: {e}"
                    )));
                    if from_retry {
                        if let Some(item) = self.retry_queue.peek_mut() {
                            item.attempts += 1;
                        }
                    } else {
                        self.retry_queue.push(current, self.log_sink.as_ref());
                        self.stats.update(self.retry_queue.len());
                    }

                    match connect_with_retry(&self.config, &self.terminate, self.log_sink.as_ref()) {
                        Ok(Some(new_conn)) => conn = new_conn,
                        Ok(None) => break,
                        Err(e) => {
                            self.log_sink.emit(LogEvent::Fatal(format!(
                                "storage worker lost the database and could not reconnect: {e}"
                            )));
                            self.terminate.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    fn test_log_sink() -> Arc<dyn LogSink> {
        Arc::new(crate::log_sink::NullLogSink)
    }

    #[test]
    fn creates_schema_and_inserts_reading() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite");
        let conn = open_and_migrate(&db_path).unwrap();
        let reading = SensorReading::new(42, 21.5, 1_700_000_000);
        insert_reading(&conn, &reading).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM SensorData WHERE SensorID = ?1 AND Value = ?2",
                params![42, 21.5],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn retry_queue_drops_oldest_on_overflow() {
        let mut queue = RetryQueue::new(2);
        let sink = crate::log_sink::NullLogSink;
        queue.push(SensorReading::new(1, 1.0, 0), &sink);
        queue.push(SensorReading::new(2, 2.0, 1), &sink);
        queue.push(SensorReading::new(3, 3.0, 2), &sink);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_mut().unwrap().reading.id, 2);
    }

    #[test]
    fn sw1_every_accepted_reading_persists_or_sits_in_retry_queue() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite");
        let config = StorageConfig {
            db_path,
            connect_retry_attempts: 1,
            connect_retry_delay: Duration::from_millis(1),
            retry_queue_capacity: 5,
        };
        let buffer = StagingBuffer::new(10);
        for i in 0..5u16 {
            buffer.insert(SensorReading::new(i + 1, i as f64, i as i64)).unwrap();
        }
        buffer.signal_shutdown();

        let terminate = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RetryQueueStats::default());
        let worker = StorageWorker::new(config.clone(), test_log_sink(), terminate, stats);
        worker.run(buffer);

        let conn = Connection::open(&config.db_path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM SensorData", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn drains_pending_readings_even_if_terminate_is_already_set() {
        // Mirrors the orchestrator's real shutdown race: `terminate` (shared
        // with the SIGINT handler) flips true before `signal_shutdown` is
        // asserted on the buffer. The worker must keep draining anyway.
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite");
        let config = StorageConfig {
            db_path,
            connect_retry_attempts: 1,
            connect_retry_delay: Duration::from_millis(1),
            retry_queue_capacity: 5,
        };
        let buffer = StagingBuffer::new(10);
        for i in 0..5u16 {
            buffer.insert(SensorReading::new(i + 1, i as f64, i as i64)).unwrap();
        }

        let terminate = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RetryQueueStats::default());
        let worker = StorageWorker::new(config.clone(), test_log_sink(), terminate, stats);

        let buffer_for_shutdown = buffer.clone();
        let shutdown_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            buffer_for_shutdown.signal_shutdown();
        });
        worker.run(buffer);
        shutdown_thread.join().unwrap();

        let conn = Connection::open(&config.db_path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM SensorData", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn connect_exhaustion_signals_termination() {
        let config = StorageConfig {
            db_path: PathBuf::from("/nonexistent/dir/that/cannot/be/created.sqlite"),
            connect_retry_attempts: 2,
            connect_retry_delay: Duration::from_millis(1),
            retry_queue_capacity: 5,
        };
        let buffer = StagingBuffer::new(4);
        let terminate = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RetryQueueStats::default());
        let worker = StorageWorker::new(config, test_log_sink(), terminate.clone(), stats);
        worker.run(buffer);
        assert!(terminate.load(Ordering::SeqCst));
    }

    #[test]
    fn retry_queue_stats_track_len_and_high_water_mark() {
        let stats = RetryQueueStats::default();
        stats.update(1);
        stats.update(3);
        stats.update(2);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.high_water_mark(), 3);
    }
}
