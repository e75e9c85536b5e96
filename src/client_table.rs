//! `ClientRecord` and the mutex-guarded table of live connections (C3 state).
//!
//! All mutation happens on the connection-manager event-loop thread; the
//! control socket's `status`/`stats` queries take the same lock from
//! another thread, so every access — including from the owning thread —
//! goes through the mutex for consistency, per spec.md §4.2.

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

/// One live sensor connection. Created on accept, mutated only by the
/// connection-manager thread, destroyed on disconnect/timeout.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub token_value: usize,
    pub ip: String,
    pub port: u16,
    pub sensor_id: Option<u16>,
    pub last_active: i64,
    pub connected_at: i64,
}

impl ClientRecord {
    pub fn new(token_value: usize, ip: String, port: u16, now: i64) -> Self {
        Self {
            token_value,
            ip,
            port,
            sensor_id: None,
            last_active: now,
            connected_at: now,
        }
    }
}

/// Counters retained across the lifetime of the gateway for the `stats`
/// control-socket command (see SPEC_FULL.md §8, "resource-exhaustion
/// accounting").
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionCounters {
    pub rejected_per_ip_cap: u64,
    pub rejected_global_cap: u64,
}

/// Mutex-guarded table of `ClientRecord`s plus admission-control policy.
pub struct ClientTable {
    inner: Mutex<Inner>,
    max_connections: usize,
    max_connections_per_ip: usize,
}

struct Inner {
    records: Vec<ClientRecord>,
    counters: AdmissionCounters,
}

/// Why an accepted socket was refused a `ClientRecord`.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    RejectedPerIpCap,
    RejectedGlobalCap,
}

impl ClientTable {
    pub fn new(max_connections: usize, max_connections_per_ip: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::with_capacity(max_connections),
                counters: AdmissionCounters::default(),
            }),
            max_connections,
            max_connections_per_ip,
        }
    }

    /// CM1/CM2: admit only while both caps hold. On `Admitted`, the record
    /// is inserted; otherwise nothing is added and the caller must close
    /// the socket itself.
    pub fn try_admit(&self, token_value: usize, ip: String, port: u16, now: i64) -> AdmissionDecision {
        let mut inner = self.inner.lock();

        if inner.records.len() >= self.max_connections {
            inner.counters.rejected_global_cap += 1;
            return AdmissionDecision::RejectedGlobalCap;
        }

        let same_ip = inner.records.iter().filter(|r| r.ip == ip).count();
        if same_ip >= self.max_connections_per_ip {
            inner.counters.rejected_per_ip_cap += 1;
            return AdmissionDecision::RejectedPerIpCap;
        }

        inner.records.push(ClientRecord::new(token_value, ip, port, now));
        AdmissionDecision::Admitted
    }

    pub fn remove(&self, token_value: usize) -> Option<ClientRecord> {
        let mut inner = self.inner.lock();
        let idx = inner.records.iter().position(|r| r.token_value == token_value)?;
        Some(inner.records.swap_remove(idx))
    }

    pub fn touch(&self, token_value: usize, now: i64) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.iter_mut().find(|r| r.token_value == token_value) {
            record.last_active = now;
        }
    }

    /// Record the sensor id carried by the first packet; identity update
    /// on subsequent packets carrying a different id (Open Question 3,
    /// resolved in SPEC_FULL.md §3). Returns the previous id, if any, so
    /// the caller can log a warning when it changes.
    pub fn set_sensor_id(&self, token_value: usize, sensor_id: u16) -> Option<Option<u16>> {
        let mut inner = self.inner.lock();
        let record = inner.records.iter_mut().find(|r| r.token_value == token_value)?;
        let previous = record.sensor_id;
        record.sensor_id = Some(sensor_id);
        Some(previous)
    }

    /// CM3: tokens idle longer than `timeout_sec` as of `now`.
    pub fn idle_tokens(&self, now: i64, timeout_sec: i64) -> Vec<usize> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter(|r| now - r.last_active > timeout_sec)
            .map(|r| r.token_value)
            .collect()
    }

    pub fn active_connection_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn admission_counters(&self) -> AdmissionCounters {
        self.inner.lock().counters
    }

    /// Thread-safe snapshot formatting for the control socket's `stats`
    /// command; never exposes `ClientRecord` identity/ordering guarantees
    /// to outside observers, only a rendered summary.
    pub fn format_connection_snapshot(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        let _ = writeln!(out, "active_connections={}", inner.records.len());
        for record in &inner.records {
            let sensor = record
                .sensor_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(
                out,
                "{}:{} sensor={} connected_at={} last_active={}",
                record.ip, record.port, sensor, record.connected_at, record.last_active
            );
        }
        let _ = writeln!(
            out,
            "rejected_per_ip_cap={} rejected_global_cap={}",
            inner.counters.rejected_per_ip_cap, inner.counters.rejected_global_cap
        );
        out
    }
}
