//! Connection management
//!
//! Handles the connection lifecycle and command execution with the meter.
//!
//! One spawned read loop owns the receive buffer and the acceptor queue.
//! Callers write commands directly and register acceptors through a channel;
//! the loop matches buffered bytes against acceptors, enforces per-request
//! deadlines and, when the transport ends, records the sticky failure and
//! fails every request still waiting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    acceptor::{Acceptor, AcceptorQueue, FixedLengthAcceptor},
    commands::{self, Button, Command, MAX_BLANK_TIMEOUT_MINUTES},
    frame::{decode_frame, DataPoint},
    serial::open_port,
    BoxedReader, BoxedWriter, Fault, ProtocolError, ReceiveBuffer, Transport, DEFAULT_BAUD_RATE,
    DEFAULT_TIMEOUT_MS,
};

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Ready, nothing outstanding
    Open,
    /// At least one response is pending
    Receiving,
    /// `close()` in progress
    Closing,
    /// A permanent fault was recorded; every operation fails
    Failed,
    /// Closed by the caller
    Closed,
}

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// `close()` finished
    Closed,
    /// The connection recorded a permanent fault
    Errored(Fault),
    /// Pending responses went from none to some, or back
    ReceivingChanged(bool),
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name, used by [`Connection::open`]
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Deadline for each response in milliseconds
    pub read_timeout_ms: u64,
    /// Largest single transport read
    pub read_chunk_size: usize,
    /// Lifecycle events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_chunk_size: 1024,
            event_capacity: 32,
        }
    }
}

impl ConnectionConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Per-response deadline
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// A decoded frame stamped with the time its response arrived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedDataPoint {
    /// Arrival time
    pub timestamp: DateTime<Utc>,
    /// Decoded frame
    #[serde(flatten)]
    pub point: DataPoint,
}

/// State shared between the connection handle and its read loop
struct Shared {
    /// Set at most once; never touched by per-request failures
    fault: OnceLock<Fault>,
    lifecycle: AtomicU8,
    pending: AtomicUsize,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    /// Record `fault` unless one is already set and return whichever fault
    /// the connection now carries.
    fn fail(&self, fault: Fault, notify: bool) -> Fault {
        match self.fault.set(fault.clone()) {
            Ok(()) => {
                if notify {
                    warn!("connection failed: {}", fault);
                    self.emit(ConnectionEvent::Errored(fault.clone()));
                }
                fault
            }
            Err(_) => self.fault.get().cloned().unwrap_or(fault),
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

struct Registration {
    acceptor: Box<dyn Acceptor>,
    deadline: Option<Instant>,
}

/// Meter connection.
///
/// All operations take `&self`; wrap the connection in an `Arc` to issue
/// requests from several tasks. Responses resolve in registration order.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    transport: Mutex<Box<dyn Transport>>,
    registrations: mpsc::UnboundedSender<Registration>,
    cancel: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Build a connection over an open transport and start its read loop.
    ///
    /// Fails with [`ProtocolError::NotOpen`] unless the transport yields both
    /// a reader and a writer. Must be called from within a Tokio runtime.
    pub fn new(mut transport: Box<dyn Transport>, config: ConnectionConfig) -> Result<Self, ProtocolError> {
        let (Some(reader), Some(writer)) = (transport.take_reader(), transport.take_writer()) else {
            return Err(ProtocolError::NotOpen);
        };

        info!("opening meter connection on {}", transport.name());

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            fault: OnceLock::new(),
            lifecycle: AtomicU8::new(LIFECYCLE_OPEN),
            pending: AtomicUsize::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            events,
        });
        let (registrations, registration_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(read_loop(
            reader,
            registration_rx,
            shared.clone(),
            cancel.clone(),
            config.read_chunk_size,
        ));

        Ok(Self {
            config,
            shared,
            writer: tokio::sync::Mutex::new(Some(writer)),
            transport: Mutex::new(transport),
            registrations,
            cancel,
            read_task: Mutex::new(Some(task)),
        })
    }

    /// Open the configured serial port and connect to the meter on it
    pub fn open(config: ConnectionConfig) -> Result<Self, ProtocolError> {
        let transport = open_port(&config.port_name, Some(config.baud_rate))?;
        Self::new(Box::new(transport), config)
    }

    /// Configuration this connection was built with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        match self.shared.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_CLOSED => ConnectionState::Closed,
            LIFECYCLE_CLOSING => ConnectionState::Closing,
            _ if self.shared.fault.get().is_some() => ConnectionState::Failed,
            _ if self.shared.pending.load(Ordering::Acquire) > 0 => ConnectionState::Receiving,
            _ => ConnectionState::Open,
        }
    }

    /// Whether a permanent fault has been recorded
    pub fn is_failed(&self) -> bool {
        self.shared.fault.get().is_some()
    }

    /// The permanent fault, if any
    pub fn failure(&self) -> Option<Fault> {
        self.shared.fault.get().cloned()
    }

    /// Subscribe to lifecycle events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Requests the read loop is currently holding
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Cumulative (tx, rx) byte counters
    pub fn counters(&self) -> (u64, u64) {
        (
            self.shared.tx_bytes.load(Ordering::Relaxed),
            self.shared.rx_bytes.load(Ordering::Relaxed),
        )
    }

    fn check_usable(&self) -> Result<(), ProtocolError> {
        if let Some(fault) = self.failure() {
            return Err(fault.into());
        }
        if self.shared.lifecycle.load(Ordering::Acquire) != LIFECYCLE_OPEN {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    fn fault_or_closed(&self) -> ProtocolError {
        self.failure()
            .map(ProtocolError::from)
            .unwrap_or(ProtocolError::ConnectionClosed)
    }

    /// Write raw command bytes.
    ///
    /// Fails without touching the transport once the connection carries a
    /// permanent fault. A failed write records one.
    pub async fn send_command(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.check_usable()?;
        let mut guard = self.writer.lock().await;
        self.write_locked(&mut guard, bytes).await
    }

    async fn write_locked(
        &self,
        writer: &mut Option<BoxedWriter>,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        // Another writer may have failed while we waited for the lock
        self.check_usable()?;
        let writer = writer.as_mut().ok_or(ProtocolError::ConnectionClosed)?;

        debug!("sending {} bytes: {:02x?}", bytes.len(), bytes);
        let result = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.shared
                    .tx_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.shared.fail(Fault::WriteFailed(reason.clone()), true);
                Err(ProtocolError::WriteFailed(reason))
            }
        }
    }

    /// Wait for the next `len` response bytes, using the configured deadline
    pub async fn receive_response(&self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.receive_response_with_timeout(len, self.config.read_timeout())
            .await
    }

    /// Wait for the next `len` response bytes.
    ///
    /// Requests resolve in the order they were made. If `timeout` elapses
    /// first the request fails with [`ProtocolError::ReadTimedOut`] and is
    /// withdrawn; the connection stays usable. A timeout too large to
    /// represent (such as `Duration::MAX`) means no deadline.
    pub async fn receive_response_with_timeout(
        &self,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.check_usable()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let (acceptor, reply) = FixedLengthAcceptor::new(len);
        self.register(Box::new(acceptor), timeout)?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(self.fault_or_closed()),
        }
    }

    fn register(&self, acceptor: Box<dyn Acceptor>, timeout: Duration) -> Result<(), ProtocolError> {
        self.registrations
            .send(Registration {
                acceptor,
                deadline: Instant::now().checked_add(timeout),
            })
            .map_err(|_| self.fault_or_closed())
    }

    /// Write a command and register for its response while holding the
    /// writer, so concurrent exchanges cannot interleave between the two.
    async fn exchange(&self, bytes: &[u8], len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.check_usable()?;
        let reply = {
            let mut guard = self.writer.lock().await;
            self.write_locked(&mut guard, bytes).await?;
            let (acceptor, reply) = FixedLengthAcceptor::new(len);
            self.register(Box::new(acceptor), self.config.read_timeout())?;
            reply
        };
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(self.fault_or_closed()),
        }
    }

    /// Switch the active charge/energy group (0..=9)
    pub async fn select_group(&self, n: u8) -> Result<(), ProtocolError> {
        self.send_command(&commands::build_select_group(n)?).await
    }

    /// Set the recording current threshold step (0..=31)
    pub async fn set_record_current(&self, threshold: u8) -> Result<(), ProtocolError> {
        self.send_command(&commands::build_set_record_current(threshold)?)
            .await
    }

    /// Set screen brightness (0..=5)
    pub async fn set_screen_brightness(&self, n: u8) -> Result<(), ProtocolError> {
        self.send_command(&commands::build_set_screen_brightness(n)?)
            .await
    }

    /// Set the screen blank timeout, rounded to whole minutes (0..=9)
    pub async fn set_screen_blank_timeout(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let minutes = (timeout.as_millis() as f64 / 60_000.0).round();
        if minutes > MAX_BLANK_TIMEOUT_MINUTES as f64 {
            return Err(ProtocolError::InvalidArgument(format!(
                "Screen blank timeout out of bounds: {:?}",
                timeout
            )));
        }
        self.send_command(&commands::build_set_screen_blank_timeout(minutes as u8)?)
            .await
    }

    /// Emulate a button press
    pub async fn click_button(&self, btn: Button) -> Result<(), ProtocolError> {
        self.send_command(&commands::build_click_button(btn)?).await
    }

    /// Request and decode one status frame
    pub async fn read_data(&self) -> Result<TimestampedDataPoint, ProtocolError> {
        let request = Command::RequestData;
        let frame = self
            .exchange(&[request.encode()?], request.response_length())
            .await?;
        let timestamp = Utc::now();
        let point = decode_frame(&frame)?;
        Ok(TimestampedDataPoint { timestamp, point })
    }

    /// Close the connection.
    ///
    /// Flushes and shuts down the writer, stops the read loop (failing any
    /// pending requests), closes the transport and emits
    /// [`ConnectionEvent::Closed`]. Safe to call on a failed connection;
    /// calls after the first return `Ok(())` immediately.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        if self
            .shared
            .lifecycle
            .compare_exchange(
                LIFECYCLE_OPEN,
                LIFECYCLE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        info!("closing meter connection");

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.flush().await {
                debug!("flush on close failed: {}", e);
            }
            if let Err(e) = writer.shutdown().await {
                debug!("writer shutdown failed: {}", e);
            }
        }

        self.cancel.cancel();
        let task = match self.read_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("read loop ended abnormally: {}", e);
            }
        }

        let result = match self.transport.lock() {
            Ok(mut transport) => transport.close(),
            Err(poisoned) => poisoned.into_inner().close(),
        };

        self.shared
            .lifecycle
            .store(LIFECYCLE_CLOSED, Ordering::Release);
        self.shared.emit(ConnectionEvent::Closed);
        result.map_err(ProtocolError::from)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publish pending count and emit `ReceivingChanged` on edges
fn publish_queue_state(shared: &Shared, queue: &AcceptorQueue, receiving: &mut bool) {
    shared.pending.store(queue.len(), Ordering::Release);
    let now_receiving = !queue.is_empty();
    if now_receiving != *receiving {
        *receiving = now_receiving;
        shared.emit(ConnectionEvent::ReceivingChanged(now_receiving));
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    mut registrations: mpsc::UnboundedReceiver<Registration>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    chunk_size: usize,
) {
    let mut buffer = ReceiveBuffer::new();
    let mut queue = AcceptorQueue::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut receiving = false;

    // (cause, whether the cause is an unexpected failure worth reporting)
    let (cause, notify) = loop {
        let deadline = queue.next_deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break (Fault::ConnectionClosed, false),

            registration = registrations.recv() => match registration {
                Some(Registration { acceptor, deadline: due }) => {
                    queue.push(acceptor, due);
                    queue.dispatch(&mut buffer);
                }
                None => break (Fault::ConnectionClosed, false),
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let expired = queue.expire(Instant::now());
                if expired > 0 {
                    debug!("{} request(s) timed out", expired);
                }
                // Bytes already buffered may belong to a timed-out response
                queue.dispatch(&mut buffer);
            }

            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("transport reached end of stream");
                    break (Fault::ConnectionClosed, true);
                }
                Ok(n) => {
                    shared.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    if let Err(e) = buffer.append(&chunk[..n]) {
                        warn!("{}: read loop bailing", e);
                        let fault = match e {
                            ProtocolError::OversizedBuffer { len, max } => {
                                Fault::OversizedBuffer { len, max }
                            }
                            _ => Fault::ConnectionClosed,
                        };
                        break (fault, true);
                    }
                    queue.dispatch(&mut buffer);
                }
                Err(e) => {
                    warn!("transport read failed: {}", e);
                    break (Fault::ConnectionClosed, true);
                }
            },
        }

        publish_queue_state(&shared, &queue, &mut receiving);
    };

    let fault = shared.fail(cause, notify);
    fail_pending(&mut queue, &mut registrations, &fault);
    buffer.clear();
    publish_queue_state(&shared, &queue, &mut receiving);
}

/// Fail queued requests, then any still waiting in the channel, which were
/// made after everything in the queue
fn fail_pending(
    queue: &mut AcceptorQueue,
    registrations: &mut mpsc::UnboundedReceiver<Registration>,
    fault: &Fault,
) {
    registrations.close();
    while let Ok(Registration { acceptor, deadline }) = registrations.try_recv() {
        queue.push(acceptor, deadline);
    }
    if !queue.is_empty() {
        debug!("failing {} pending request(s): {}", queue.len(), fault);
    }
    queue.drain(fault);
}
