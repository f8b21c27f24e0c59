//! Simulated devices
//!
//! [`SimTransport`] stands in for the serial driver when no hardware is
//! attached. Each simulated port is backed by a [`SimDevice`] script: lines
//! written to the port are matched against the script's rules and the first
//! matching rule's response is written back. Opening a port creates a
//! `tokio::io::duplex` pair whose far end is driven by a device task.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use com_port::sim::{SimDevice, SimTransport};
//! use com_port::ComPort;
//!
//! # async fn demo() -> Result<(), com_port::PortError> {
//! let transport = SimTransport::new();
//! let probe = transport.add_port("/dev/ttySIM0", SimDevice::new().respond("ID?", "INITTED"));
//!
//! let port = ComPort::new("/dev/ttySIM0", Arc::new(transport.clone()));
//! port.connect(Some(9600)).await?;
//! assert_eq!(probe.open_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::error::PortError;
use crate::transport::{BoxedIo, PortDescriptor, Transport};

/// Pause between chunks when a response is split
const CHUNK_GAP: Duration = Duration::from_millis(5);

/// Bytes buffered in each direction of a simulated link
const LINK_CAPACITY: usize = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted reply
#[derive(Debug, Clone)]
struct Rule {
    command: Regex,
    response: String,
}

/// Scripted behaviour of a simulated device
#[derive(Debug, Clone)]
pub struct SimDevice {
    rules: Vec<Rule>,
    delay: Duration,
    chunk_size: Option<usize>,
    line_ending: String,
    greeting: Option<String>,
    refuse_open: bool,
    open_delay: Duration,
    hang_up_on_open: bool,
    capacity: usize,
    read_stall: Duration,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A device that never answers
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            delay: Duration::ZERO,
            chunk_size: None,
            line_ending: "\r\n".to_string(),
            greeting: None,
            refuse_open: false,
            open_delay: Duration::ZERO,
            hang_up_on_open: false,
            capacity: LINK_CAPACITY,
            read_stall: Duration::ZERO,
        }
    }

    /// Reply with `response` when exactly `command` is written
    pub fn respond(self, command: &str, response: impl Into<String>) -> Self {
        let exact = format!("^{}$", regex::escape(command));
        match Regex::new(&exact) {
            Ok(pattern) => self.respond_matching(pattern, response),
            Err(_) => self,
        }
    }

    /// Reply with `response` to any command matching `pattern`
    pub fn respond_matching(mut self, pattern: Regex, response: impl Into<String>) -> Self {
        self.rules.push(Rule {
            command: pattern,
            response: response.into(),
        });
        self
    }

    /// Wait this long before each reply
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Deliver replies in pieces of at most `size` bytes
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Line ending appended to replies (default `\r\n`)
    pub fn line_ending(mut self, ending: impl Into<String>) -> Self {
        self.line_ending = ending.into();
        self
    }

    /// Send `text` as soon as the port opens
    pub fn greeting(mut self, text: impl Into<String>) -> Self {
        self.greeting = Some(text.into());
        self
    }

    /// Make every open attempt fail
    pub fn refuse_open(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    /// Block the opening thread this long before the port is ready
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Open successfully, then drop the link at once
    pub fn hang_up_on_open(mut self) -> Self {
        self.hang_up_on_open = true;
        self
    }

    /// Buffer at most `bytes` in each direction, so large writes block
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes.max(1);
        self
    }

    /// Pause this long before each read from the host
    pub fn read_stall(mut self, stall: Duration) -> Self {
        self.read_stall = stall;
        self
    }

    fn reply_for(&self, command: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.command.is_match(command))
            .map(|rule| rule.response.as_str())
    }
}

#[derive(Default)]
struct SimPortShared {
    writes: Mutex<Vec<(Instant, String)>>,
    bauds: Mutex<Vec<u32>>,
    opens: AtomicUsize,
    open: AtomicBool,
    inject: Mutex<Option<mpsc::UnboundedSender<String>>>,
    hangup: Notify,
}

/// Test-side view of a simulated port
#[derive(Clone, Default)]
pub struct SimHandle {
    shared: Arc<SimPortShared>,
}

impl SimHandle {
    /// Command lines received, oldest first (terminators stripped)
    pub fn writes(&self) -> Vec<String> {
        lock(&self.shared.writes)
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Command lines with the instant each one was received
    pub fn timed_writes(&self) -> Vec<(Instant, String)> {
        lock(&self.shared.writes).clone()
    }

    /// How many times the port was opened
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Baud rates used by each open, in order
    pub fn bauds(&self) -> Vec<u32> {
        lock(&self.shared.bauds).clone()
    }

    /// Whether the device side currently has the port open
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Push unsolicited output to the host; false if the port is not open
    pub fn emit(&self, text: impl Into<String>) -> bool {
        match lock(&self.shared.inject).as_ref() {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Drop the device end of the link, as if the cable were pulled
    pub fn hang_up(&self) {
        self.shared.hangup.notify_one();
    }

    fn record(&self, line: String) {
        lock(&self.shared.writes).push((Instant::now(), line));
    }
}

struct SimPort {
    descriptor: PortDescriptor,
    device: Arc<SimDevice>,
    handle: SimHandle,
}

#[derive(Default)]
struct SimState {
    ports: Vec<SimPort>,
    list_error: Option<String>,
}

/// In-memory transport with scripted devices
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port with only a path
    pub fn add_port(&self, path: &str, device: SimDevice) -> SimHandle {
        self.add_described_port(PortDescriptor::new(path), device)
    }

    /// Add a port with full enumeration metadata
    pub fn add_described_port(&self, descriptor: PortDescriptor, device: SimDevice) -> SimHandle {
        let handle = SimHandle::default();
        let mut state = lock(&self.state);
        state.ports.retain(|p| p.descriptor.path != descriptor.path);
        state.ports.push(SimPort {
            descriptor,
            device: Arc::new(device),
            handle: handle.clone(),
        });
        handle
    }

    /// Unplug a port: it disappears from listings and its link drops
    pub fn remove_port(&self, path: &str) {
        let mut state = lock(&self.state);
        if let Some(pos) = state.ports.iter().position(|p| p.descriptor.path == path) {
            let port = state.ports.remove(pos);
            port.handle.hang_up();
        }
    }

    /// Make `list_ports` fail with `reason` (or succeed again with `None`)
    pub fn fail_listing(&self, reason: Option<String>) {
        lock(&self.state).list_error = reason;
    }
}

impl Transport for SimTransport {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError> {
        let state = lock(&self.state);
        if let Some(reason) = &state.list_error {
            return Err(PortError::Enumeration(reason.clone()));
        }
        Ok(state.ports.iter().map(|p| p.descriptor.clone()).collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedIo, PortError> {
        let (device, handle) = {
            let state = lock(&self.state);
            let port = state
                .ports
                .iter()
                .find(|p| p.descriptor.path == path)
                .ok_or_else(|| PortError::Open {
                    path: path.to_string(),
                    reason: "no such port".to_string(),
                })?;
            (Arc::clone(&port.device), port.handle.clone())
        };

        if device.refuse_open {
            return Err(PortError::Open {
                path: path.to_string(),
                reason: "device refused to open".to_string(),
            });
        }
        if !device.open_delay.is_zero() {
            std::thread::sleep(device.open_delay);
        }

        let (host, far) = tokio::io::duplex(device.capacity);
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        *lock(&handle.shared.inject) = Some(inject_tx);
        lock(&handle.shared.bauds).push(baud_rate);
        handle.shared.opens.fetch_add(1, Ordering::SeqCst);
        handle.shared.open.store(true, Ordering::SeqCst);

        debug!("Simulated device on {} opened at {} baud", path, baud_rate);
        tokio::spawn(run_device(device, handle, far, inject_rx));
        Ok(Box::new(host))
    }
}

async fn write_reply(device: &SimDevice, io: &mut DuplexStream, text: &str) -> std::io::Result<()> {
    let bytes = text.as_bytes();
    match device.chunk_size {
        Some(size) => {
            for piece in bytes.chunks(size) {
                io.write_all(piece).await?;
                io.flush().await?;
                tokio::time::sleep(CHUNK_GAP).await;
            }
        }
        None => {
            io.write_all(bytes).await?;
            io.flush().await?;
        }
    }
    Ok(())
}

/// Device task: answers complete command lines until the host hangs up
async fn run_device(
    device: Arc<SimDevice>,
    handle: SimHandle,
    mut io: DuplexStream,
    mut inject: mpsc::UnboundedReceiver<String>,
) {
    let mut buf = [0u8; 256];
    let mut line = String::new();

    if device.hang_up_on_open {
        debug!("Simulated device hung up on open");
        handle.shared.open.store(false, Ordering::SeqCst);
        *lock(&handle.shared.inject) = None;
        return;
    }

    if let Some(greeting) = &device.greeting {
        let text = format!("{}{}", greeting, device.line_ending);
        let _ = write_reply(&device, &mut io, &text).await;
    }

    loop {
        if !device.read_stall.is_zero() {
            tokio::time::sleep(device.read_stall).await;
        }
        tokio::select! {
            result = io.read(&mut buf) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                line.push_str(&String::from_utf8_lossy(&buf[..n]));

                while let Some(pos) = line.find('\n') {
                    let command = line[..pos].trim_end_matches('\r').to_string();
                    line.drain(..=pos);
                    trace!("Simulated device received {:?}", command);
                    handle.record(command.clone());

                    if let Some(reply) = device.reply_for(&command) {
                        if !device.delay.is_zero() {
                            tokio::time::sleep(device.delay).await;
                        }
                        let text = format!("{}{}", reply, device.line_ending);
                        if write_reply(&device, &mut io, &text).await.is_err() {
                            break;
                        }
                    }
                }
            }

            Some(text) = inject.recv() => {
                if write_reply(&device, &mut io, &text).await.is_err() {
                    break;
                }
            }

            _ = handle.shared.hangup.notified() => {
                debug!("Simulated device hung up");
                break;
            }
        }
    }

    handle.shared.open.store(false, Ordering::SeqCst);
    *lock(&handle.shared.inject) = None;
}
