//! Orchestrator (C6): wires the components together and owns the
//! `Init → Running → Draining → Stopped` lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::analytics::{AnalyticsConfig, AnalyticsWorker};
use crate::client_table::ClientTable;
use crate::config::AppConfig;
use crate::connection_manager::{ConnectionManager, ConnectionManagerConfig};
use crate::control_socket::ControlSocket;
use crate::error::GatewayError;
use crate::log_sink::{LogEvent, LogSink};
use crate::room_map::RoomMap;
use crate::staging_buffer::StagingBuffer;
use crate::storage::{RetryQueueStats, StorageConfig, StorageWorker};
use crate::wire::SensorReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Running,
    Draining,
    Stopped,
}

/// Owns every long-lived thread handle and the shared shutdown flag. `run`
/// blocks until a termination signal arrives, then drains in a fixed order:
/// stop accepting new connections, let both staging buffers drain, join the
/// analytics and storage workers, join the connection manager, join the
/// control socket, release the room map.
pub struct Orchestrator {
    state: Mutex<LifecycleState>,
    terminate: Arc<AtomicBool>,
    log_sink: Arc<dyn LogSink>,
}

impl Orchestrator {
    pub fn new(log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Init),
            terminate: Arc::new(AtomicBool::new(false)),
            log_sink,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("orchestrator state mutex poisoned")
    }

    pub fn terminate_handle(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Moves into `Draining`. Idempotent: a second call (e.g. a second
    /// SIGINT while already shutting down) is a silent no-op after the
    /// first, logged-once transition.
    fn enter_draining(&self) {
        let mut state = self.state.lock().expect("orchestrator state mutex poisoned");
        if *state == LifecycleState::Draining || *state == LifecycleState::Stopped {
            return;
        }
        *state = LifecycleState::Draining;
        self.log_sink.emit(LogEvent::Info("shutdown requested, draining".to_string()));
    }

    fn enter_stopped(&self) {
        *self.state.lock().expect("orchestrator state mutex poisoned") = LifecycleState::Stopped;
    }

    pub fn run(&self, port: u16, config: &AppConfig) -> Result<(), GatewayError> {
        if port == 0 {
            return Err(GatewayError::InvalidArgument(
                "port must be between 1 and 65535".to_string(),
            ));
        }

        {
            let mut state = self.state.lock().expect("orchestrator state mutex poisoned");
            if *state != LifecycleState::Init {
                return Err(GatewayError::InvalidArgument("orchestrator already running".to_string()));
            }
            *state = LifecycleState::Running;
        }

        let room_map = Arc::new(RoomMap::load(&PathBuf::from(&config.map_file_name)));
        self.log_sink.emit(LogEvent::Info(format!("loaded room map with {} entries", room_map.len())));

        let analytics_buffer: Arc<StagingBuffer<SensorReading>> = StagingBuffer::new(config.staging_buffer_size);
        let storage_buffer: Arc<StagingBuffer<SensorReading>> = StagingBuffer::new(config.staging_buffer_size);

        let bind_addr = format!("0.0.0.0:{port}")
            .parse()
            .map_err(|e| GatewayError::InvalidArgument(format!("invalid port {port}: {e}")))?;

        let cm_config = ConnectionManagerConfig {
            bind_addr,
            backlog: config.tcp_backlog,
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            sensor_timeout_sec: config.sensor_timeout_sec,
            select_timeout_sec: config.select_timeout_sec,
        };
        let connection_manager = Arc::new(ConnectionManager::new(
            cm_config,
            analytics_buffer.clone(),
            storage_buffer.clone(),
            self.log_sink.clone(),
        ));
        let client_table: Arc<ClientTable> = connection_manager.client_table();

        let (poll, listener, cm_shutdown) = connection_manager.bind()?;
        self.log_sink.emit(LogEvent::Info(format!("listening on port {port}")));

        let cm_for_thread = connection_manager.clone();
        let connection_manager_handle: JoinHandle<()> = thread::spawn(move || {
            cm_for_thread.run(poll, listener);
        });

        let analytics_config = AnalyticsConfig {
            too_cold: config.temp_too_cold_threshold,
            too_hot: config.temp_too_hot_threshold,
        };
        let analytics_worker = AnalyticsWorker::new(analytics_config, room_map.clone(), self.log_sink.clone());
        let analytics_buffer_for_thread = analytics_buffer.clone();
        let analytics_handle: JoinHandle<()> =
            thread::spawn(move || analytics_worker.run(analytics_buffer_for_thread));

        let storage_config = StorageConfig {
            db_path: PathBuf::from(&config.db_path),
            connect_retry_attempts: config.db_connect_retry_attempts,
            connect_retry_delay: std::time::Duration::from_secs(config.db_connect_retry_delay_sec),
            retry_queue_capacity: config.retry_queue_capacity,
        };
        let retry_queue_stats = Arc::new(RetryQueueStats::default());
        let storage_worker = StorageWorker::new(
            storage_config,
            self.log_sink.clone(),
            self.terminate.clone(),
            retry_queue_stats.clone(),
        );
        let storage_buffer_for_thread = storage_buffer.clone();
        let storage_handle: JoinHandle<()> = thread::spawn(move || storage_worker.run(storage_buffer_for_thread));

        let control_socket = ControlSocket::new(
            PathBuf::from(&config.control_socket_path),
            client_table,
            retry_queue_stats,
            self.log_sink.clone(),
            self.terminate.clone(),
        );
        let control_socket_handle: JoinHandle<()> = thread::spawn(move || control_socket.run());

        while !self.terminate.load(Ordering::SeqCst) {
            thread::sleep(std::time::Duration::from_millis(100));
        }

        self.enter_draining();
        cm_shutdown.request_shutdown();
        analytics_buffer.signal_shutdown();
        storage_buffer.signal_shutdown();

        connection_manager_handle.join().expect("connection manager thread panicked");
        analytics_handle.join().expect("analytics worker thread panicked");
        storage_handle.join().expect("storage worker thread panicked");
        control_socket_handle.join().expect("control socket thread panicked");

        self.enter_stopped();
        self.log_sink.emit(LogEvent::Info("shutdown complete".to_string()));
        Ok(())
    }

    /// Requests shutdown without blocking; safe to call from a signal
    /// handler. A second call while already draining is a no-op.
    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::NullLogSink;

    #[test]
    fn starts_in_init_state() {
        let orchestrator = Orchestrator::new(Arc::new(NullLogSink));
        assert_eq!(orchestrator.state(), LifecycleState::Init);
    }

    #[test]
    fn draining_entry_is_idempotent() {
        let orchestrator = Orchestrator::new(Arc::new(NullLogSink));
        orchestrator.enter_draining();
        assert_eq!(orchestrator.state(), LifecycleState::Draining);
        orchestrator.enter_draining();
        assert_eq!(orchestrator.state(), LifecycleState::Draining);
    }

    #[test]
    fn stopped_after_draining_is_terminal() {
        let orchestrator = Orchestrator::new(Arc::new(NullLogSink));
        orchestrator.enter_draining();
        orchestrator.enter_stopped();
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        orchestrator.enter_draining();
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
    }

    #[test]
    fn rejects_port_zero_before_touching_state() {
        let orchestrator = Orchestrator::new(Arc::new(NullLogSink));
        let config = AppConfig::default();
        let result = orchestrator.run(0, &config);
        assert!(matches!(result, Err(GatewayError::InvalidArgument(_))));
        assert_eq!(orchestrator.state(), LifecycleState::Init);
    }
}
