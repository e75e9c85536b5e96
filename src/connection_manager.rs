//! Connection manager (C3): the ingest front end.
//!
//! A single supervisory thread multiplexes the listener, a shutdown waker,
//! and all live client sockets through `mio::Poll`. `SELECT_TIMEOUT_SEC`
//! bounds each wait so the idle-client scan runs at least once per second
//! even with no socket activity.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Socket, Type};

use crate::client_table::{now_unix, AdmissionDecision, ClientTable};
use crate::error::GatewayError;
use crate::log_sink::{LogEvent, LogSink};
use crate::staging_buffer::StagingBuffer;
use crate::wire::{self, SensorReading, PACKET_SIZE};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

pub struct ConnectionManagerConfig {
    pub bind_addr: SocketAddr,
    pub backlog: u32,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub sensor_timeout_sec: i64,
    pub select_timeout_sec: u64,
}

struct ClientSlot {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: [u8; PACKET_SIZE],
    filled: usize,
}

/// Owns the listener, the per-client sockets, and the mutex-guarded client
/// table. Runs entirely on the thread that calls `run`.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    client_table: Arc<ClientTable>,
    analytics_buffer: Arc<StagingBuffer<SensorReading>>,
    storage_buffer: Arc<StagingBuffer<SensorReading>>,
    log_sink: Arc<dyn LogSink>,
    shutdown: Arc<AtomicBool>,
}

/// A cloneable, thread-safe shutdown trigger for the connection manager's
/// event loop, backed by an `mio::Waker` so the blocking `poll` call wakes
/// up immediately instead of waiting out its timeout.
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, GatewayError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(GatewayError::Io)?;
    socket.set_reuse_address(true).map_err(GatewayError::Io)?;
    socket.set_nonblocking(true).map_err(GatewayError::Io)?;
    socket.bind(&addr.into()).map_err(GatewayError::Io)?;
    socket.listen(backlog as i32).map_err(GatewayError::Io)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionManagerConfig,
        analytics_buffer: Arc<StagingBuffer<SensorReading>>,
        storage_buffer: Arc<StagingBuffer<SensorReading>>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        let client_table = Arc::new(ClientTable::new(config.max_connections, config.max_connections_per_ip));
        Self {
            config,
            client_table,
            analytics_buffer,
            storage_buffer,
            log_sink,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client_table(&self) -> Arc<ClientTable> {
        self.client_table.clone()
    }

    /// Binds the listener and registers the shutdown waker, returning a
    /// handle the orchestrator can use from another thread. Must be called
    /// before `run`.
    pub fn bind(&self) -> Result<(Poll, TcpListener, ShutdownHandle), GatewayError> {
        let mut listener = bind_listener(self.config.bind_addr, self.config.backlog)?;
        let poll = Poll::new().map_err(GatewayError::Io)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(GatewayError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(GatewayError::Io)?);
        let handle = ShutdownHandle {
            flag: self.shutdown.clone(),
            waker,
        };
        Ok((poll, listener, handle))
    }

    /// Runs the event loop until shutdown is requested. Closes the listener
    /// first, then every live client socket, then returns.
    pub fn run(&self, mut poll: Poll, mut listener: TcpListener) {
        let mut events = Events::with_capacity(1024);
        let mut clients: HashMap<usize, ClientSlot> = HashMap::new();
        let mut next_token = FIRST_CLIENT_TOKEN;
        let timeout = Duration::from_secs(self.config.select_timeout_sec);

        'outer: loop {
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.log_sink.emit(LogEvent::Error(format!("poll failed: {e}")));
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                        self.accept_all(&mut listener, &poll, &mut clients, &mut next_token);
                    }
                    WAKER => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                    }
                    token => {
                        self.service_client(token.0, &poll, &mut clients);
                    }
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break 'outer;
            }

            self.scan_idle_clients(&poll, &mut clients);
        }

        poll.registry().deregister(&mut listener).ok();
        // back-to-front so swap-style removal during traversal stays safe
        let tokens: Vec<usize> = clients.keys().copied().collect();
        for token in tokens.into_iter().rev() {
            self.close_client(token, &poll, &mut clients);
        }
    }

    fn accept_all(
        &self,
        listener: &mut TcpListener,
        poll: &Poll,
        clients: &mut HashMap<usize, ClientSlot>,
        next_token: &mut usize,
    ) {
        loop {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let now = now_unix();
                    let ip = addr.ip().to_string();
                    let decision = self.client_table.try_admit(*next_token, ip.clone(), addr.port(), now);
                    match decision {
                        AdmissionDecision::Admitted => {
                            let token = Token(*next_token);
                            if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
                                self.log_sink.emit(LogEvent::Error(format!("failed to register client socket: {e}")));
                                self.client_table.remove(*next_token);
                                continue;
                            }
                            clients.insert(
                                *next_token,
                                ClientSlot {
                                    stream,
                                    addr,
                                    read_buf: [0u8; PACKET_SIZE],
                                    filled: 0,
                                },
                            );
                            *next_token += 1;
                        }
                        AdmissionDecision::RejectedPerIpCap => {
                            self.log_sink.emit(LogEvent::Warning(format!(
                                "rejecting connection from {ip}: per-IP connection cap reached"
                            )));
                        }
                        AdmissionDecision::RejectedGlobalCap => {
                            self.log_sink.emit(LogEvent::Warning(format!(
                                "rejecting connection from {ip}: global connection cap reached"
                            )));
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.log_sink.emit(LogEvent::Error(format!("accept failed: {e}")));
                    break;
                }
            }
        }
    }

    fn service_client(&self, token_value: usize, poll: &Poll, clients: &mut HashMap<usize, ClientSlot>) {
        let mut should_close = false;
        if let Some(slot) = clients.get_mut(&token_value) {
            loop {
                match slot.stream.read(&mut slot.read_buf[slot.filled..]) {
                    Ok(0) => {
                        if slot.filled > 0 {
                            self.log_sink.emit(LogEvent::Warning(format!(
                                "{}: connection closed mid-packet, treating as protocol violation",
                                slot.addr
                            )));
                        } else {
                            self.log_sink.emit(LogEvent::Info(format!("{}: disconnected", slot.addr)));
                        }
                        should_close = true;
                        break;
                    }
                    Ok(n) => {
                        slot.filled += n;
                        if slot.filled == PACKET_SIZE {
                            self.handle_packet(token_value, slot);
                            slot.filled = 0;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        self.log_sink.emit(LogEvent::Error(format!("{}: read error: {e}", slot.addr)));
                        should_close = true;
                        break;
                    }
                }
            }
        }
        if should_close {
            self.close_client(token_value, poll, clients);
        }
    }

    fn handle_packet(&self, token_value: usize, slot: &mut ClientSlot) {
        let now = now_unix();
        match wire::decode_packet(&slot.read_buf) {
            Ok((sensor_id, value)) => {
                if sensor_id == wire::INVALID_SENSOR_ID {
                    self.log_sink.emit(LogEvent::Warning(format!(
                        "{}: received reserved sensor id 0, forwarding anyway",
                        slot.addr
                    )));
                }

                self.client_table.touch(token_value, now);
                if let Some(previous) = self.client_table.set_sensor_id(token_value, sensor_id) {
                    if let Some(old_id) = previous {
                        if old_id != sensor_id {
                            self.log_sink.emit(LogEvent::Warning(format!(
                                "{}: sensor id changed from {old_id} to {sensor_id}, updating identity",
                                slot.addr
                            )));
                        }
                    }
                }

                let reading = SensorReading::new(sensor_id, value, now);
                self.forward(reading);
            }
            Err(e) => {
                self.log_sink.emit(LogEvent::Warning(format!("{}: {e}", slot.addr)));
            }
        }
    }

    fn forward(&self, reading: SensorReading) {
        if let Err(e) = self.analytics_buffer.insert(reading) {
            if !matches!(e, GatewayError::BufferShutdown) {
                self.log_sink.emit(LogEvent::Error(format!("analytics buffer insert failed: {e}")));
            }
        }
        if let Err(e) = self.storage_buffer.insert(reading) {
            if !matches!(e, GatewayError::BufferShutdown) {
                self.log_sink.emit(LogEvent::Error(format!("storage buffer insert failed: {e}")));
            }
        }
    }

    fn scan_idle_clients(&self, poll: &Poll, clients: &mut HashMap<usize, ClientSlot>) {
        let now = now_unix();
        let idle = self.client_table.idle_tokens(now, self.config.sensor_timeout_sec);
        for token_value in idle.into_iter().rev() {
            self.log_sink.emit(LogEvent::Info(format!("disconnecting idle client token {token_value}")));
            self.close_client(token_value, poll, clients);
        }
    }

    fn close_client(&self, token_value: usize, poll: &Poll, clients: &mut HashMap<usize, ClientSlot>) {
        if let Some(mut slot) = clients.remove(&token_value) {
            poll.registry().deregister(&mut slot.stream).ok();
        }
        self.client_table.remove(token_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::NullLogSink;

    fn manager() -> ConnectionManager {
        let config = ConnectionManagerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            backlog: 10,
            max_connections: 100,
            max_connections_per_ip: 5,
            sensor_timeout_sec: 5,
            select_timeout_sec: 1,
        };
        ConnectionManager::new(
            config,
            StagingBuffer::new(4),
            StagingBuffer::new(4),
            Arc::new(NullLogSink),
        )
    }

    #[test]
    fn forward_delivers_to_both_buffers() {
        let mgr = manager();
        let reading = SensorReading::new(7, 20.0, 0);
        mgr.forward(reading);
        assert_eq!(mgr.analytics_buffer.remove().unwrap(), reading);
        assert_eq!(mgr.storage_buffer.remove().unwrap(), reading);
    }

    #[test]
    fn bind_listener_honors_ephemeral_port_request() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
