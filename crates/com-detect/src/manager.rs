//! Fleet manager
//!
//! Owns the registered device profiles and every connection discovered so
//! far. A scan reconciles the transport's port list with the known
//! connections:
//!
//! - a known, classified port gets a liveness check (its `init` operation)
//!   and is closed if the check fails; it keeps its profile
//! - a known, unclassified port is dropped so the next scan probes it afresh
//! - an unknown port gets a new connection and is probed with each profile
//!   in registration order until one answers
//!
//! Ports that disappear from the listing are left alone. Requests are routed
//! to a connection by profile name plus index or display name.

use std::collections::HashSet;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use com_port::{ComPort, PortSnapshot, Transport};
use com_protocol::{DeviceProfile, ProtocolError, INIT_OPERATION};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::error::DetectError;
use crate::scanner::PortScanner;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

/// Picks one connection among those of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Position in discovery order
    Index(usize),
    /// Display name set with [`ComPort::set_name`]
    Name(String),
}

impl From<usize> for Selector {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Selector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

struct FleetInner {
    transport: Arc<dyn Transport>,
    config: RwLock<FleetConfig>,
    profiles: RwLock<Vec<Arc<DeviceProfile>>>,
    connections: RwLock<Vec<ComPort>>,
    /// Serializes scans from init, its retry and the rescan task
    scan_lock: AsyncMutex<()>,
    rescan: Mutex<Option<JoinHandle<()>>>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for FleetInner {
    fn drop(&mut self) {
        for slot in [&mut self.rescan, &mut self.retry] {
            let task = slot.get_mut().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(task) = task {
                task.abort();
            }
        }
    }
}

/// Discovers devices and routes operations to them
///
/// Cloning is cheap; clones share the same registry. Methods that start
/// background tasks must be called from within a tokio runtime.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

impl FleetManager {
    /// Create a manager with default settings
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, FleetConfig::default())
    }

    /// Create a manager
    pub fn with_config(transport: Arc<dyn Transport>, config: FleetConfig) -> Self {
        Self {
            inner: Arc::new(FleetInner {
                transport,
                config: RwLock::new(config),
                profiles: RwLock::new(Vec::new()),
                connections: RwLock::new(Vec::new()),
                scan_lock: AsyncMutex::new(()),
                rescan: Mutex::new(None),
                retry: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<FleetInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Current settings
    pub fn config(&self) -> FleetConfig {
        read(&self.inner.config).clone()
    }

    /// Registered profiles, in probe order
    pub fn profiles(&self) -> Vec<Arc<DeviceProfile>> {
        read(&self.inner.profiles).clone()
    }

    /// Replace the registered profiles; names must be unique
    pub fn set_profiles(&self, profiles: Vec<DeviceProfile>) -> Result<(), DetectError> {
        let names: Vec<String> = profiles.iter().map(|p| p.name().to_string()).collect();
        let mut seen = HashSet::new();
        if let Some(duplicate) = names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(ProtocolError::DuplicateProfile(duplicate.clone()).into());
        }

        info!("Registered profiles: {}", names.join(", "));
        *write(&self.inner.profiles) = profiles.into_iter().map(Arc::new).collect();
        Ok(())
    }

    /// All connections, in discovery order
    pub fn connections(&self) -> Vec<ComPort> {
        read(&self.inner.connections).clone()
    }

    /// Display view of every connection
    pub fn snapshots(&self) -> Vec<PortSnapshot> {
        self.connections().iter().map(ComPort::snapshot).collect()
    }

    fn find_connection(&self, path: &str) -> Option<ComPort> {
        read(&self.inner.connections)
            .iter()
            .find(|c| c.path() == path)
            .cloned()
    }

    fn connections_for(&self, profile: &str) -> Vec<ComPort> {
        read(&self.inner.connections)
            .iter()
            .filter(|c| c.profile().is_some_and(|p| p.name() == profile))
            .cloned()
            .collect()
    }

    fn ensure_profile(&self, profile: &str) -> Result<(), DetectError> {
        if read(&self.inner.profiles).iter().any(|p| p.name() == profile) {
            Ok(())
        } else {
            Err(DetectError::ProfileNotFound(profile.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Reconcile the port listing with the known connections
    ///
    /// Fails only if enumeration fails; problems with individual ports are
    /// logged.
    pub async fn scan(&self) -> Result<(), DetectError> {
        let _scan = self.inner.scan_lock.lock().await;
        let config = self.config();

        let scanner = PortScanner::with_skip_patterns(
            Arc::clone(&self.inner.transport),
            config.skip_patterns,
        );
        let ports = tokio::task::spawn_blocking(move || scanner.enumerate_ports())
            .await
            .map_err(|e| DetectError::Port(com_port::PortError::Enumeration(e.to_string())))??;

        let profiles = self.profiles();
        let mut tasks = JoinSet::new();

        for port in ports {
            match self.find_connection(&port.path) {
                Some(conn) if conn.profile().is_some() => {
                    tasks.spawn(check_liveness(conn));
                }
                Some(conn) => {
                    debug!("Dropping unclassified {}", conn.path());
                    write(&self.inner.connections).retain(|c| c.path() != conn.path());
                }
                None => {
                    debug!("New port {}", port.path);
                    let conn = ComPort::with_config(
                        port.path.clone(),
                        Arc::clone(&self.inner.transport),
                        &config.port,
                    );
                    conn.set_info(port);
                    write(&self.inner.connections).push(conn.clone());
                    tasks.spawn(identify(conn, profiles.clone()));
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Scan task failed: {}", e);
            }
        }

        let connections = self.connections();
        let classified = connections.iter().filter(|c| c.profile().is_some()).count();
        info!(
            "Scan complete: {} connection(s), {} classified",
            connections.len(),
            classified
        );
        Ok(())
    }

    /// Start periodic rescanning, replacing any pending rescan
    ///
    /// Each cycle sleeps the interval and then scans; the next sleep starts
    /// once the scan has finished. A negative interval disables rescanning.
    /// Replacing or cancelling the schedule never interrupts a scan already
    /// in progress.
    pub fn schedule_rescan(&self) {
        let mut slot = lock(&self.inner.rescan);
        if let Some(task) = slot.take() {
            task.abort();
        }

        let Some(interval) = self.config().rescan_interval() else {
            debug!("Rescan disabled");
            return;
        };

        debug!("Rescanning every {:?}", interval);
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = FleetManager::from_weak(&weak) else {
                    break;
                };
                if let Err(e) = manager.detached_scan().await {
                    warn!("Rescan failed: {}", e);
                }
            }
        }));
    }

    /// Stop periodic rescanning
    pub fn cancel_rescan(&self) {
        if let Some(task) = lock(&self.inner.rescan).take() {
            debug!("Rescan cancelled");
            task.abort();
        }
    }

    /// Change the rescan interval and reschedule
    pub fn set_rescan_interval(&self, interval_ms: i64) {
        write(&self.inner.config).rescan_interval_ms = interval_ms;
        self.schedule_rescan();
    }

    /// Register `profiles`, scan, and start rescanning
    ///
    /// A failed scan is logged and retried after the configured delay;
    /// rescanning starts either way. Duplicate profile names are rejected.
    pub async fn init(&self, profiles: Vec<DeviceProfile>) -> Result<(), DetectError> {
        self.set_profiles(profiles)?;

        if let Err(e) = self.scan().await {
            warn!(
                "Initial scan failed, retrying in {:?}: {}",
                self.config().init_retry_delay(),
                e
            );
            self.schedule_retry();
        }

        self.schedule_rescan();
        Ok(())
    }

    /// Scan in a task of its own
    ///
    /// Aborting the caller leaves the scan running to completion, so probes
    /// in flight still close their ports.
    async fn detached_scan(self) -> Result<(), DetectError> {
        tokio::spawn(async move { self.scan().await })
            .await
            .map_err(|e| DetectError::ScanTask(e.to_string()))?
    }

    fn schedule_retry(&self) {
        let delay = self.config().init_retry_delay();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(manager) = FleetManager::from_weak(&weak) else {
                    break;
                };
                match manager.detached_scan().await {
                    Ok(()) => {
                        info!("Initial scan succeeded on retry");
                        break;
                    }
                    Err(e) => warn!("Initial scan retry failed: {}", e),
                }
            }
        });

        if let Some(previous) = lock(&self.inner.retry).replace(task) {
            previous.abort();
        }
    }

    /// Stop background tasks and close every open connection
    pub async fn shutdown(&self) {
        self.cancel_rescan();
        if let Some(task) = lock(&self.inner.retry).take() {
            task.abort();
        }

        for conn in self.connections() {
            if !conn.state().is_open() {
                continue;
            }
            if let Err(e) = conn.close().await {
                warn!("Closing {}: {}", conn.path(), e);
            }
        }
        info!("Fleet shut down");
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Find a connection of `profile` by index or display name
    pub fn get_connection(
        &self,
        profile: &str,
        selector: impl Into<Selector>,
    ) -> Result<ComPort, DetectError> {
        self.ensure_profile(profile)?;
        let matching = self.connections_for(profile);

        match selector.into() {
            Selector::Index(index) => {
                let count = matching.len();
                matching
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| DetectError::IndexOutOfRange {
                        profile: profile.to_string(),
                        index,
                        count,
                    })
            }
            Selector::Name(name) => matching
                .into_iter()
                .find(|c| c.name().as_deref() == Some(name.as_str()))
                .ok_or_else(|| DetectError::ConnectionNotFound {
                    profile: profile.to_string(),
                    name,
                }),
        }
    }

    /// Run `operation` on one connection of `profile`
    pub async fn send(
        &self,
        profile: &str,
        selector: impl Into<Selector>,
        operation: &str,
        params: Option<&Value>,
    ) -> Result<Vec<String>, DetectError> {
        let conn = self.get_connection(profile, selector)?;
        Ok(conn.send(operation, params).await?)
    }

    /// Run `operation` on every connection of `profile`, one after another
    ///
    /// Returns one response list per connection, in discovery order. Stops
    /// at the first failure.
    pub async fn list(
        &self,
        profile: &str,
        operation: &str,
        params: Option<&Value>,
    ) -> Result<Vec<Vec<String>>, DetectError> {
        self.ensure_profile(profile)?;
        let mut results = Vec::new();
        for conn in self.connections_for(profile) {
            results.push(conn.send(operation, params).await?);
        }
        Ok(results)
    }
}

/// Re-run `init` on a classified connection; close it if that fails
async fn check_liveness(conn: ComPort) {
    match conn.send(INIT_OPERATION, None).await {
        Ok(_) => debug!("{} still answering", conn.path()),
        Err(e) => {
            warn!("{} failed liveness check: {}", conn.path(), e);
            if let Err(e) = conn.close().await {
                warn!("Closing {}: {}", conn.path(), e);
            }
        }
    }
}

/// Probe a new connection with each profile until one answers
async fn identify(conn: ComPort, profiles: Vec<Arc<DeviceProfile>>) {
    for profile in profiles {
        match conn.classify(&profile).await {
            Ok(true) => {
                info!("{} is a {}", conn.path(), profile.name());
                conn.set_profile(Some(profile));
                if let Err(e) = conn.connect(None).await {
                    warn!("Reopening {}: {}", conn.path(), e);
                }
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("Probing {} as {}: {}", conn.path(), profile.name(), e),
        }
    }
    debug!("{} did not match any profile", conn.path());
}
