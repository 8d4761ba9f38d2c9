//! Per-device sessions and their manager
//!
//! One [`Session`] is shared by every concurrent client of a device: a single
//! capture driver fans out to any number of responders. The first caller's
//! parameters become canonical for the session's lifetime; a background
//! reaper thread releases the hardware once no clients remain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::params::CaptureParams;
use crate::video::{device, CaptureDriver, PixelFormat};

/// Reaper wake-up cadence
const REAP_INTERVAL: Duration = Duration::from_secs(10);
/// Granularity at which the reaper thread notices shutdown
const REAP_TICK: Duration = Duration::from_millis(250);

/// Shared state for all clients of one capture device.
pub struct Session {
    pub device_id: String,
    /// Canonical parameters: the first caller's request, adjusted once by
    /// device negotiation.
    params: RwLock<CaptureParams>,
    pub capture: Arc<CaptureDriver>,
    /// SPS/PPS from the first IDR; write-once, read-many.
    sps: OnceLock<Vec<u8>>,
    pps: OnceLock<Vec<u8>>,
    pub client_count: AtomicI64,
    /// Bumped by the feedback endpoint; UDP senders poll it and force an IDR
    /// when it advances.
    pub idr_requests: AtomicU64,
    /// Per-session frame counter used as the UDP framing `frame_id`.
    pub frame_seq: AtomicU32,
    started: Mutex<Instant>,
    last_accessed: Mutex<Instant>,
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl Session {
    fn new(device_id: &str, params: CaptureParams) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            device_id: device_id.to_string(),
            params: RwLock::new(params),
            capture: Arc::new(CaptureDriver::new()),
            sps: OnceLock::new(),
            pps: OnceLock::new(),
            client_count: AtomicI64::new(0),
            idr_requests: AtomicU64::new(0),
            frame_seq: AtomicU32::new(0),
            started: Mutex::new(now),
            last_accessed: Mutex::new(now),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    /// Snapshot of the canonical parameters.
    pub fn params(&self) -> CaptureParams {
        self.params.read().clone()
    }

    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_accessed.lock().elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started.lock().elapsed()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.capture.pixel_format()
    }

    /// Start the capture driver if it is not running, syncing the canonical
    /// parameters with what the device negotiated and resetting the traffic
    /// counters for the fresh run.
    pub fn ensure_started(&self) -> Result<()> {
        if self.capture.running() {
            return Ok(());
        }
        let mut params = self.params.write();
        if self.capture.running() {
            return Ok(());
        }
        self.capture.start(&self.device_id, &mut params)?;
        *self.started.lock() = Instant::now();
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Cached parameter sets, if a responder has extracted them already.
    pub fn parameter_sets(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        match (self.sps.get(), self.pps.get()) {
            (Some(sps), Some(pps)) => Some((sps.clone(), pps.clone())),
            _ => None,
        }
    }

    pub fn cache_parameter_sets(&self, sps: Vec<u8>, pps: Vec<u8>) {
        let _ = self.sps.set(sps);
        let _ = self.pps.set(pps);
    }

    /// Stamp one delivered frame onto the session counters.
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }
}

/// Process-wide session registry plus the idle reaper.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
    reaper_stop: Arc<AtomicBool>,
    reaper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SessionManager {
    /// Create the manager and spawn its reaper thread.
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            reaper_stop: Arc::new(AtomicBool::new(false)),
            reaper: Mutex::new(None),
        });

        let weak: Weak<SessionManager> = Arc::downgrade(&manager);
        let stop = manager.reaper_stop.clone();
        let handle = std::thread::Builder::new()
            .name("session-reaper".into())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(REAP_TICK);
                    elapsed += REAP_TICK;
                    if elapsed < REAP_INTERVAL {
                        continue;
                    }
                    elapsed = Duration::ZERO;
                    match weak.upgrade() {
                        Some(manager) => manager.reap(),
                        None => break,
                    }
                }
            })
            .expect("failed to spawn session reaper");
        *manager.reaper.lock() = Some(handle);

        manager
    }

    /// Return the existing session for `device_id` or insert a fresh one
    /// whose canonical params are the caller's.
    pub fn get_or_create(&self, device_id: &str, params: &CaptureParams) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(device_id) {
            return session.clone();
        }
        info!("Creating session for {}", device_id);
        let session = Session::new(device_id, params.clone());
        sessions.insert(device_id.to_string(), session.clone());
        session
    }

    /// Lookup without creating.
    pub fn find(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(device_id).cloned()
    }

    pub fn touch(&self, device_id: &str) {
        if let Some(session) = self.find(device_id) {
            session.touch();
        }
    }

    /// Stop and remove the session when it has no clients left.
    pub fn release_if_idle(&self, device_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(device_id) {
            if session.client_count.load(Ordering::SeqCst) == 0 {
                info!("Releasing idle session for {}", device_id);
                session.capture.stop();
                sessions.remove(device_id);
            }
        }
    }

    /// Enumerate capture devices (delegated to the device probe).
    pub fn list_devices(&self) -> Vec<String> {
        device::list_devices()
    }

    /// One reaper pass: stop and remove every session that has been idle
    /// with no clients for longer than the timeout.
    pub fn reap(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|device_id, session| {
            let idle = session.client_count.load(Ordering::SeqCst) == 0
                && session.idle_for() > self.idle_timeout;
            if idle {
                info!("Reaping idle session for {}", device_id);
                session.capture.stop();
            }
            !idle
        });
    }

    /// Stop the reaper, join it, then drop all sessions (stopping their
    /// drivers).
    pub fn shutdown(&self) {
        self.reaper_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
        let mut sessions = self.sessions.lock();
        for (device_id, session) in sessions.drain() {
            debug!("Stopping session for {}", device_id);
            session.capture.stop();
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.reaper_stop.store(true, Ordering::SeqCst);
    }
}

/// RAII client registration: increments the session's client count on
/// creation and runs the disconnect path (decrement + release-if-idle) on
/// drop, whatever the response outcome was.
pub struct ClientGuard {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
}

impl ClientGuard {
    pub fn new(manager: Arc<SessionManager>, session: Arc<Session>) -> Self {
        session.client_count.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session, manager }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.session.client_count.fetch_sub(1, Ordering::SeqCst);
        // The session may already be gone if the reaper won the race; the
        // release below is a no-op in that case.
        self.manager.release_if_idle(&self.session.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Duration::from_secs(10))
    }

    #[test]
    fn test_get_or_create_returns_shared_session() {
        let manager = manager();
        let params = CaptureParams::default();
        let a = manager.get_or_create("video0", &params);
        let b = manager.get_or_create("video0", &params);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.session_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_canonical_params_are_first_callers() {
        let manager = manager();
        let first = CaptureParams::default();
        manager.get_or_create("video0", &first);

        let mut second = CaptureParams::default();
        second.width = 1920;
        second.height = 1080;
        let session = manager.get_or_create("video0", &second);
        assert_eq!(session.params().width, 640);
        assert_eq!(session.params().height, 480);
        manager.shutdown();
    }

    #[test]
    fn test_client_guard_counts() {
        let manager = manager();
        let session = manager.get_or_create("video0", &CaptureParams::default());

        {
            let _a = ClientGuard::new(manager.clone(), session.clone());
            assert_eq!(session.client_count.load(Ordering::SeqCst), 1);
            {
                let _b = ClientGuard::new(manager.clone(), session.clone());
                assert_eq!(session.client_count.load(Ordering::SeqCst), 2);
            }
            assert_eq!(session.client_count.load(Ordering::SeqCst), 1);
            // Still one client: the session must survive.
            assert!(manager.find("video0").is_some());
        }

        // Last guard dropped: eagerly released.
        assert_eq!(session.client_count.load(Ordering::SeqCst), 0);
        assert!(manager.find("video0").is_none());
        manager.shutdown();
    }

    #[test]
    fn test_release_if_idle_keeps_active_session() {
        let manager = manager();
        let session = manager.get_or_create("video0", &CaptureParams::default());
        let _guard = ClientGuard::new(manager.clone(), session.clone());

        manager.release_if_idle("video0");
        assert!(manager.find("video0").is_some());
        manager.shutdown();
    }

    #[test]
    fn test_reap_removes_stale_sessions() {
        let manager = SessionManager::new(Duration::ZERO);
        manager.get_or_create("video0", &CaptureParams::default());
        std::thread::sleep(Duration::from_millis(5));

        manager.reap();
        assert_eq!(manager.session_count(), 0);

        // Second pass with no traffic is a no-op.
        manager.reap();
        assert_eq!(manager.session_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn test_reap_skips_sessions_with_clients() {
        let manager = SessionManager::new(Duration::ZERO);
        let session = manager.get_or_create("video0", &CaptureParams::default());
        let _guard = ClientGuard::new(manager.clone(), session);
        std::thread::sleep(Duration::from_millis(5));

        manager.reap();
        assert_eq!(manager.session_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let manager = SessionManager::new(Duration::from_millis(50));
        let session = manager.get_or_create("video0", &CaptureParams::default());
        std::thread::sleep(Duration::from_millis(60));
        session.touch();
        manager.reap();
        assert_eq!(manager.session_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_parameter_set_cache_is_write_once() {
        let manager = manager();
        let session = manager.get_or_create("video0", &CaptureParams::default());
        assert!(session.parameter_sets().is_none());

        session.cache_parameter_sets(vec![1, 2], vec![3, 4]);
        session.cache_parameter_sets(vec![9], vec![9]);
        let (sps, pps) = session.parameter_sets().unwrap();
        assert_eq!(sps, vec![1, 2]);
        assert_eq!(pps, vec![3, 4]);
        manager.shutdown();
    }

    #[test]
    fn test_record_sent_updates_counters() {
        let manager = manager();
        let session = manager.get_or_create("video0", &CaptureParams::default());
        session.record_sent(100);
        session.record_sent(50);
        assert_eq!(session.frames_sent.load(Ordering::Relaxed), 2);
        assert_eq!(session.bytes_sent.load(Ordering::Relaxed), 150);
        manager.shutdown();
    }
}
