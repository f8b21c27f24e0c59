//! Port connection state machine
//!
//! A [`ComPort`] owns one serial path and the transport handle opened on it.
//! It moves between four states:
//!
//! ```text
//!   closed ──connect──▶ connecting ──ok──▶ background ◀──match / soft error──┐
//!     ▲                     │                  │                              │
//!     └──────open failed────┘                  └──────write command──────▶ busy
//!     ▲                                                                      │
//!     └──────────────close / transport closed (from background or busy)──────┘
//! ```
//!
//! While `background`, incoming data is appended to a bounded line log.
//! While `busy`, incoming data accumulates in a read buffer that is matched
//! against the pattern of the macro in flight.
//!
//! Concurrent callers are serialized by a port lock: a caller that finds the
//! port busy or connecting waits on the state watch channel, bounded by the
//! port's [`LockPolicy`]. With [`LockOrdering::Fifo`] callers additionally
//! queue on a fair mutex, so they run in arrival order and each operation
//! executes as a unit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use com_protocol::{DeviceProfile, Macro, INIT_OPERATION};
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{LockOrdering, LockPolicy, PortConfig};
use crate::error::PortError;
use crate::log::BackgroundLog;
use crate::state::{PortSnapshot, PortState};
use crate::transport::{BoxedIo, PortDescriptor, Transport, TransportFault};

/// Reader buffer size
const READ_CHUNK: usize = 1024;

/// Pause after a non-fatal read error before reading again
const FAULT_BACKOFF: Duration = Duration::from_millis(100);

type Writer = Arc<AsyncMutex<WriteHalf<BoxedIo>>>;

/// Next move for a caller trying to take the port lock
enum Step {
    Connect(u32, u64),
    Wait(PortState),
}

/// Live transport handle
struct Link {
    writer: Writer,
    reader: JoinHandle<()>,
}

/// A read waiting for its pattern
struct PendingRead {
    lease: u64,
    pattern: Regex,
    buffer: String,
    started: Instant,
    done: oneshot::Sender<Result<String, PortError>>,
}

/// Caller's side of a [`PendingRead`]; the deadline is fixed when the read
/// begins, before anything is written
struct ReadWait {
    rx: oneshot::Receiver<Result<String, PortError>>,
    deadline: Instant,
    timeout: Duration,
}

struct PortInner {
    state: PortState,
    /// Bumped on every connect/close so events from old handles are ignored
    generation: u64,
    /// Bumped on every lock acquisition
    lease: u64,
    link: Option<Link>,
    pending: Option<PendingRead>,
    profile: Option<Arc<DeviceProfile>>,
    name: Option<String>,
    last_error: Option<String>,
    timeout: Duration,
    line_terminator: String,
    lock: LockPolicy,
    log: BackgroundLog,
    info: PortDescriptor,
}

struct Shared {
    path: String,
    transport: Arc<dyn Transport>,
    inner: Mutex<PortInner>,
    state_tx: watch::Sender<PortState>,
    queue: AsyncMutex<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = inner.link.take() {
            link.reader.abort();
        }
    }
}

/// Releases a lock lease when dropped, including on cancellation
struct Lease<'a> {
    port: &'a ComPort,
    id: u64,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.port.release(self.id);
    }
}

/// Closes the port in the background if a probe is dropped midway
struct CloseOnDrop {
    port: Option<ComPort>,
}

impl CloseOnDrop {
    fn new(port: &ComPort) -> Self {
        Self {
            port: Some(port.clone()),
        }
    }

    fn disarm(mut self) {
        self.port = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(port) = self.port.take() else {
            return;
        };
        debug!("Probe of {} dropped, closing", port.shared.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = port.close().await {
                        warn!("Closing {} after dropped probe: {}", port.shared.path, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close {} after dropped probe", port.shared.path),
        }
    }
}

/// Handle to one port connection
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct ComPort {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ComPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComPort")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .finish()
    }
}

impl ComPort {
    /// Create a closed connection for `path` with default settings
    pub fn new(path: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(path, transport, &PortConfig::default())
    }

    /// Create a closed connection for `path`
    pub fn with_config(
        path: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: &PortConfig,
    ) -> Self {
        let path = path.into();
        let (state_tx, _) = watch::channel(PortState::Closed);
        let inner = PortInner {
            state: PortState::Closed,
            generation: 0,
            lease: 0,
            link: None,
            pending: None,
            profile: None,
            name: None,
            last_error: None,
            timeout: config.read_timeout(),
            line_terminator: config.line_terminator.clone(),
            lock: config.lock.clone(),
            log: BackgroundLog::new(),
            info: PortDescriptor::new(path.clone()),
        };

        Self {
            shared: Arc::new(Shared {
                path,
                transport,
                inner: Mutex::new(inner),
                state_tx,
                queue: AsyncMutex::new(()),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, PortInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut PortInner, state: PortState) {
        if inner.state != state {
            trace!(
                "{}: {} -> {}",
                self.shared.path,
                inner.state.name(),
                state.name()
            );
        }
        inner.state = state;
        self.shared.state_tx.send_replace(state);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Serial port path
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Current state
    pub fn state(&self) -> PortState {
        self.inner().state
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PortState> {
        self.shared.state_tx.subscribe()
    }

    /// Assigned profile
    pub fn profile(&self) -> Option<Arc<DeviceProfile>> {
        self.inner().profile.clone()
    }

    /// Assign or clear the profile
    pub fn set_profile(&self, profile: Option<Arc<DeviceProfile>>) {
        self.inner().profile = profile;
    }

    /// Display name used for routing
    pub fn name(&self) -> Option<String> {
        self.inner().name.clone()
    }

    /// Set the display name
    pub fn set_name(&self, name: Option<String>) {
        self.inner().name = name;
    }

    /// Last transport or open error
    pub fn last_error(&self) -> Option<String> {
        self.inner().last_error.clone()
    }

    /// Response deadline per macro
    pub fn timeout(&self) -> Duration {
        self.inner().timeout
    }

    /// Set the response deadline per macro
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner().timeout = timeout;
    }

    /// Terminator appended to every write
    pub fn line_terminator(&self) -> String {
        self.inner().line_terminator.clone()
    }

    /// Set the terminator appended to every write
    pub fn set_line_terminator(&self, terminator: impl Into<String>) {
        self.inner().line_terminator = terminator.into();
    }

    /// Waiting policy for concurrent callers
    pub fn lock_policy(&self) -> LockPolicy {
        self.inner().lock.clone()
    }

    /// Set the waiting policy for concurrent callers
    pub fn set_lock_policy(&self, policy: LockPolicy) {
        self.inner().lock = policy;
    }

    /// Device metadata
    pub fn info(&self) -> PortDescriptor {
        self.inner().info.clone()
    }

    /// Replace device metadata (the path is kept)
    pub fn set_info(&self, mut info: PortDescriptor) {
        info.path = self.shared.path.clone();
        self.inner().info = info;
    }

    /// Copy of the background log, oldest first
    pub fn background_log(&self) -> Vec<String> {
        self.inner().log.entries()
    }

    /// Take the background log, leaving it empty
    pub fn drain_log(&self) -> Vec<String> {
        self.inner().log.drain()
    }

    /// Point-in-time view for display
    pub fn snapshot(&self) -> PortSnapshot {
        let inner = self.inner();
        PortSnapshot {
            path: self.shared.path.clone(),
            name: inner.name.clone(),
            state: inner.state,
            profile: inner.profile.as_ref().map(|p| p.name().to_string()),
            last_error: inner.last_error.clone(),
            log_len: inner.log.len(),
            info: inner.info.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Open / close
    // ------------------------------------------------------------------

    /// Open the port
    ///
    /// Uses `baud_override` if given, otherwise the assigned profile's baud
    /// rate. Any previously open handle is released first.
    pub async fn connect(&self, baud_override: Option<u32>) -> Result<(), PortError> {
        let (baud_rate, generation) = {
            let mut inner = self.inner();
            self.start_connect(&mut inner, baud_override)?
        };
        self.finish_connect(baud_rate, generation).await
    }

    /// Resolve the baud rate, drop any live handle and enter `connecting`
    fn start_connect(
        &self,
        inner: &mut PortInner,
        baud_override: Option<u32>,
    ) -> Result<(u32, u64), PortError> {
        let baud_rate = baud_override
            .or_else(|| inner.profile.as_ref().map(|p| p.baud_rate()))
            .ok_or_else(|| PortError::NoBaudRate(self.shared.path.clone()))?;

        inner.generation += 1;
        if let Some(pending) = inner.pending.take() {
            let _ = pending.done.send(Err(self.transport_error("port reconnected")));
        }
        if let Some(link) = inner.link.take() {
            debug!("Releasing previous handle on {}", self.shared.path);
            link.reader.abort();
        }
        self.set_state(inner, PortState::Connecting);
        Ok((baud_rate, inner.generation))
    }

    /// Open the transport and enter `background`, or fall back to `closed`
    async fn finish_connect(&self, baud_rate: u32, generation: u64) -> Result<(), PortError> {
        debug!("Connecting {} at {} baud", self.shared.path, baud_rate);
        let transport = Arc::clone(&self.shared.transport);
        let path = self.shared.path.clone();
        let opened = match tokio::task::spawn_blocking(move || transport.open(&path, baud_rate))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(PortError::Open {
                path: self.shared.path.clone(),
                reason: e.to_string(),
            }),
        };

        let mut inner = self.inner();
        if inner.generation != generation {
            debug!("Connect on {} superseded", self.shared.path);
            return Err(PortError::Open {
                path: self.shared.path.clone(),
                reason: "superseded by another connect or close".to_string(),
            });
        }

        match opened {
            Ok(io) => {
                let (reader, writer) = tokio::io::split(io);
                let reader = tokio::spawn(read_loop(
                    Arc::downgrade(&self.shared),
                    generation,
                    reader,
                ));
                inner.link = Some(Link {
                    writer: Arc::new(AsyncMutex::new(writer)),
                    reader,
                });
                self.set_state(&mut inner, PortState::Background);
                info!("Port {} open at {} baud", self.shared.path, baud_rate);
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    e @ PortError::Open { .. } => e,
                    other => PortError::Open {
                        path: self.shared.path.clone(),
                        reason: other.to_string(),
                    },
                };
                warn!("{}", e);
                inner.last_error = Some(e.to_string());
                self.set_state(&mut inner, PortState::Closed);
                Err(e)
            }
        }
    }

    /// Close the port
    ///
    /// The connection ends up closed even if the transport reports an error
    /// while shutting down; that error is still returned.
    pub async fn close(&self) -> Result<(), PortError> {
        let link = {
            let mut inner = self.inner();
            inner.generation += 1;
            if let Some(pending) = inner.pending.take() {
                let _ = pending.done.send(Err(self.transport_error("port closed")));
            }
            let link = inner.link.take();
            self.set_state(&mut inner, PortState::Closed);
            link
        };

        let Some(link) = link else {
            return Ok(());
        };

        link.reader.abort();
        let result = link.writer.lock().await.shutdown().await;
        debug!("Closed {}", self.shared.path);

        result.map_err(|e| {
            let e = PortError::Close {
                path: self.shared.path.clone(),
                reason: e.to_string(),
            };
            self.inner().last_error = Some(e.to_string());
            e
        })
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Run a named operation from the assigned profile
    pub async fn send(
        &self,
        operation: &str,
        params: Option<&Value>,
    ) -> Result<Vec<String>, PortError> {
        let profile = self
            .profile()
            .ok_or_else(|| PortError::NoProfile(self.shared.path.clone()))?;
        let macros = profile.operation(operation)?;
        self.send_macros(macros, params).await
    }

    /// Run macros in order and collect their responses
    ///
    /// With `params`, every command template is resolved first. On failure
    /// the port is returned to `background` (or stays `closed` if the
    /// transport went away) and the error is returned.
    pub async fn send_macros(
        &self,
        macros: &[Macro],
        params: Option<&Value>,
    ) -> Result<Vec<String>, PortError> {
        if macros.is_empty() {
            return Err(PortError::EmptyMacroList(self.shared.path.clone()));
        }

        let resolved: Vec<Macro> = match params {
            Some(params) => macros.iter().map(|m| m.with_params(params)).collect(),
            None => macros.to_vec(),
        };

        let _turn = self.take_turn().await?;
        let mut responses = Vec::with_capacity(resolved.len());
        for m in &resolved {
            match self.execute(m).await {
                Ok(response) => responses.push(response),
                Err(e) => {
                    warn!("Command {:?} on {} failed: {}", m.command(), self.shared.path, e);
                    return Err(e);
                }
            }
        }
        Ok(responses)
    }

    /// Wait for incoming data matching `pattern` without writing anything
    ///
    /// The port is held busy while waiting, so only data arriving after the
    /// call counts; the background log is not searched.
    pub async fn read(&self, pattern: &Regex) -> Result<String, PortError> {
        let _turn = self.take_turn().await?;
        let id = self.acquire().await?;
        let _lease = Lease { port: self, id };
        let wait = self.begin_read(id, pattern.clone());
        self.await_read(wait).await
    }

    /// Probe the port with `profile`'s init operation
    ///
    /// Opens at the profile's baud rate, waits its startup delay, runs `init`
    /// and closes again whatever happened. `Ok(false)` means the device did
    /// not answer in time.
    pub async fn classify(&self, profile: &DeviceProfile) -> Result<bool, PortError> {
        debug!("Probing {} as {}", self.shared.path, profile.name());
        let guard = CloseOnDrop::new(self);
        if let Err(e) = self.connect(Some(profile.baud_rate())).await {
            guard.disarm();
            return Err(e);
        }

        let probe = async {
            if !profile.startup_delay().is_zero() {
                tokio::time::sleep(profile.startup_delay()).await;
            }
            self.send_macros(profile.init(), None).await
        }
        .await;

        guard.disarm();
        if let Err(e) = self.close().await {
            warn!("Closing {} after probe: {}", self.shared.path, e);
        }

        match probe {
            Ok(responses) => {
                info!(
                    "Identified {} as {} ({:?})",
                    self.shared.path,
                    profile.name(),
                    responses.last()
                );
                Ok(true)
            }
            Err(e) if e.is_timeout() => {
                debug!("No {} {} reply on {}", profile.name(), INIT_OPERATION, self.shared.path);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Feed received text into the state machine
    pub fn receive_data(&self, chunk: &str) {
        let mut inner = self.inner();
        self.on_data(&mut inner, chunk);
    }

    /// Report an asynchronous transport error
    pub fn receive_error(&self, fault: TransportFault) {
        let mut inner = self.inner();
        self.on_fault(&mut inner, fault);
    }

    fn deliver_data(&self, generation: u64, chunk: &str) {
        let mut inner = self.inner();
        if inner.generation != generation {
            trace!("Dropping data from stale handle on {}", self.shared.path);
            return;
        }
        self.on_data(&mut inner, chunk);
    }

    fn deliver_fault(&self, generation: u64, fault: TransportFault) {
        let mut inner = self.inner();
        if inner.generation != generation {
            trace!("Dropping fault from stale handle on {}", self.shared.path);
            return;
        }
        self.on_fault(&mut inner, fault);
    }

    fn on_data(&self, inner: &mut PortInner, chunk: &str) {
        match inner.state {
            PortState::Busy if inner.pending.is_some() => {
                let matched = match inner.pending.as_mut() {
                    Some(pending) => {
                        pending.buffer.push_str(chunk);
                        let trimmed = pending.buffer.trim();
                        trace!("{} read buffer: {:?}", self.shared.path, trimmed);
                        pending
                            .pattern
                            .is_match(trimmed)
                            .then(|| trimmed.to_string())
                    }
                    None => None,
                };

                if let Some(response) = matched {
                    if let Some(pending) = inner.pending.take() {
                        self.set_state(inner, PortState::Background);
                        debug!(
                            "Response on {} after {:?}: {:?}",
                            self.shared.path,
                            pending.started.elapsed(),
                            response
                        );
                        let _ = pending.done.send(Ok(response));
                    }
                }
            }
            PortState::Busy | PortState::Background => {
                inner.log.push_chunk(chunk);
            }
            PortState::Closed | PortState::Connecting => {
                warn!(
                    "Unexpected data on {} while {}: {:?}",
                    self.shared.path,
                    inner.state.name(),
                    chunk
                );
            }
        }
    }

    fn on_fault(&self, inner: &mut PortInner, fault: TransportFault) {
        warn!(
            "Transport error on {} ({}): {}",
            self.shared.path,
            if fault.still_open { "still open" } else { "closed" },
            fault.message
        );
        inner.last_error = Some(fault.message.clone());

        if let Some(pending) = inner.pending.take() {
            let _ = pending.done.send(Err(self.transport_error(&fault.message)));
        }

        if fault.still_open {
            if inner.state == PortState::Busy {
                self.set_state(inner, PortState::Background);
            }
        } else {
            inner.generation += 1;
            if let Some(link) = inner.link.take() {
                link.reader.abort();
            }
            self.set_state(inner, PortState::Closed);
        }
    }

    // ------------------------------------------------------------------
    // Locking and reads
    // ------------------------------------------------------------------

    /// Queue behind earlier callers when ordering is FIFO
    async fn take_turn(&self) -> Result<Option<AsyncMutexGuard<'_, ()>>, PortError> {
        let policy = self.lock_policy();
        match policy.ordering {
            LockOrdering::Polled => Ok(None),
            LockOrdering::Fifo => {
                tokio::time::timeout(policy.lock_budget(), self.shared.queue.lock())
                    .await
                    .map(Some)
                    .map_err(|_| PortError::LockTimeout {
                        path: self.shared.path.clone(),
                        attempts: policy.lock_attempts,
                    })
            }
        }
    }

    /// Move the port to `busy`, connecting first if it is closed
    ///
    /// Returns the lease id that identifies this holder.
    async fn acquire(&self) -> Result<u64, PortError> {
        let policy = self.lock_policy();
        let mut state_rx = self.shared.state_tx.subscribe();
        let mut connect_waits = 0;
        let mut busy_waits = 0;

        loop {
            state_rx.borrow_and_update();
            let step = {
                let mut inner = self.inner();
                let current = inner.state;
                match current {
                    PortState::Background => {
                        inner.lease += 1;
                        self.set_state(&mut inner, PortState::Busy);
                        return Ok(inner.lease);
                    }
                    PortState::Closed => {
                        let (baud_rate, generation) = self.start_connect(&mut inner, None)?;
                        Step::Connect(baud_rate, generation)
                    }
                    state => Step::Wait(state),
                }
            };

            match step {
                Step::Connect(baud_rate, generation) => {
                    self.finish_connect(baud_rate, generation).await?;
                    continue;
                }
                Step::Wait(PortState::Connecting) => {
                    connect_waits += 1;
                    if connect_waits > policy.connect_attempts {
                        return Err(PortError::ConnectTimeout {
                            path: self.shared.path.clone(),
                            attempts: policy.connect_attempts,
                        });
                    }
                }
                Step::Wait(_) => {
                    busy_waits += 1;
                    if busy_waits > policy.lock_attempts {
                        return Err(PortError::LockTimeout {
                            path: self.shared.path.clone(),
                            attempts: policy.lock_attempts,
                        });
                    }
                }
            }

            let _ = tokio::time::timeout(policy.poll_interval(), state_rx.changed()).await;
        }
    }

    /// Give up a lease: back to `background` if still busy under it
    fn release(&self, id: u64) {
        let mut inner = self.inner();
        if inner.lease != id {
            return;
        }
        if inner.pending.as_ref().is_some_and(|p| p.lease == id) {
            inner.pending = None;
        }
        if inner.state == PortState::Busy {
            self.set_state(&mut inner, PortState::Background);
        }
    }

    /// Install a pending read; clears the read buffer and last error
    fn begin_read(&self, lease: u64, pattern: Regex) -> ReadWait {
        let (done, rx) = oneshot::channel();
        let started = Instant::now();
        let mut inner = self.inner();
        inner.last_error = None;
        let timeout = inner.timeout;
        let previous = inner.pending.replace(PendingRead {
            lease,
            pattern,
            buffer: String::new(),
            started,
            done,
        });
        if let Some(previous) = previous {
            let _ = previous.done.send(Err(self.transport_error("read superseded")));
        }
        ReadWait {
            rx,
            deadline: started + timeout,
            timeout,
        }
    }

    async fn await_read(&self, wait: ReadWait) -> Result<String, PortError> {
        match tokio::time::timeout_at(wait.deadline, wait.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.transport_error("read abandoned")),
            Err(_) => Err(PortError::Timeout {
                path: self.shared.path.clone(),
                timeout_ms: wait.timeout.as_millis() as u64,
            }),
        }
    }

    /// Write one macro and wait for its response
    async fn execute(&self, m: &Macro) -> Result<String, PortError> {
        let id = self.acquire().await?;
        let _lease = Lease { port: self, id };

        let (writer, terminator) = {
            let inner = self.inner();
            (
                inner.link.as_ref().map(|link| Arc::clone(&link.writer)),
                inner.line_terminator.clone(),
            )
        };
        let Some(writer) = writer else {
            return Err(self.transport_error("port closed"));
        };

        let wait = self.begin_read(id, m.response().clone());
        let line = format!("{}{}", m.command(), terminator);
        debug!("Write to {}: {:?}", self.shared.path, line);

        let written: std::io::Result<()> = async {
            let mut writer = writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            let reason = e.to_string();
            self.inner().last_error = Some(reason.clone());
            return Err(PortError::Write {
                path: self.shared.path.clone(),
                reason,
            });
        }

        self.await_read(wait).await
    }

    fn transport_error(&self, message: &str) -> PortError {
        PortError::Transport {
            path: self.shared.path.clone(),
            message: message.to_string(),
        }
    }
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next read
///
/// Invalid bytes become U+FFFD one sequence at a time.
fn take_text(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut pos = 0;

    while pos < pending.len() {
        match std::str::from_utf8(&pending[pos..]) {
            Ok(valid) => {
                text.push_str(valid);
                pos = pending.len();
            }
            Err(e) => {
                let valid_up_to = pos + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[pos..valid_up_to]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pos = valid_up_to + len;
                    }
                    None => {
                        pos = valid_up_to;
                        break;
                    }
                }
            }
        }
    }

    pending.drain(..pos);
    text
}

/// Reader task: turns reads into data and fault events
async fn read_loop(shared: Weak<Shared>, generation: u64, mut reader: ReadHalf<BoxedIo>) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut carry = Vec::new();

    loop {
        let fault = match reader.read(&mut buf).await {
            Ok(0) => TransportFault::closed("port closed"),
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let text = take_text(&mut carry);
                if text.is_empty() {
                    continue;
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                ComPort { shared }.deliver_data(generation, &text);
                continue;
            }
            Err(e) => match TransportFault::from_io(&e) {
                Some(fault) => fault,
                None => continue,
            },
        };

        let still_open = fault.still_open;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        ComPort { shared }.deliver_fault(generation, fault);
        if !still_open {
            break;
        }
        tokio::time::sleep(FAULT_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_text_keeps_partial_utf8() {
        // "é" is 0xC3 0xA9
        let mut carry = vec![b'o', b'k', 0xC3];
        assert_eq!(take_text(&mut carry), "ok");
        assert_eq!(carry, vec![0xC3]);

        carry.push(0xA9);
        assert_eq!(take_text(&mut carry), "é");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_take_text_replaces_invalid() {
        let mut carry = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_text(&mut carry), "a\u{FFFD}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_take_text_invalid_byte_then_split_char() {
        let mut carry = vec![b'a', 0xFF, b'b', 0xC3];
        assert_eq!(take_text(&mut carry), "a\u{FFFD}b");
        assert_eq!(carry, vec![0xC3]);

        carry.push(0xA9);
        assert_eq!(take_text(&mut carry), "é");
        assert!(carry.is_empty());
    }
}
