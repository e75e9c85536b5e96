pub mod analytics;
pub mod client_table;
pub mod config;
pub mod connection_manager;
pub mod control_socket;
pub mod error;
pub mod log_sink;
pub mod orchestrator;
pub mod room_map;
pub mod staging_buffer;
pub mod storage;
pub mod wire;

pub use analytics::{AnalyticsConfig, AnalyticsWorker, SensorStats, TempState};
pub use client_table::{AdmissionCounters, AdmissionDecision, ClientRecord, ClientTable};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use connection_manager::{ConnectionManager, ConnectionManagerConfig, ShutdownHandle};
pub use control_socket::ControlSocket;
pub use error::GatewayError;
pub use log_sink::{LogEvent, LogSink, NullLogSink, StdLogSink};
pub use orchestrator::{LifecycleState, Orchestrator};
pub use room_map::RoomMap;
pub use staging_buffer::StagingBuffer;
pub use storage::{RetryQueueStats, StorageConfig, StorageWorker};
pub use wire::{decode_packet, encode_packet, SensorReading, PACKET_SIZE};
