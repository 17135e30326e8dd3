//! Stream worker: one thread per live camera connection.
//!
//! Lifecycle: `Disconnected → Connecting → Streaming ⇄ Reconnecting → Disconnected`.
//!
//! The worker exclusively owns its `FrameSource` and `DetectionPipeline`. It writes into
//! the camera's `FrameCache`; readers go through `WorkerHandle`. A worker ends when it
//! is told to stop (release, shutdown), goes idle, loses its camera record, or runs out
//! of reconnect attempts. On exit it releases the connection, clears the cache and
//! calls its exit hook (the registry uses it to deregister).

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::{FrameCache, FrameCacheEntry};
use crate::frame::{encode_jpeg, Frame};
use crate::ingest::FrameSource;
use crate::pipeline::DetectionPipeline;
use crate::snapshot::{CountSnapshot, PersistenceScheduler};
use crate::storage::SharedStore;
use crate::{now_s, CameraId, FootfallError};

const HISTORY_LIMIT: usize = 32;
const FINISH_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Released by a viewer or an explicit request.
    Released,
    /// Nobody read the cache for `idle_timeout`.
    Idle,
    /// Camera record missing or deactivated.
    CameraRemoved,
    ReconnectBudgetExhausted,
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StopReason::Released => "released",
            StopReason::Idle => "idle",
            StopReason::CameraRemoved => "camera record no longer exists",
            StopReason::ReconnectBudgetExhausted => "reconnect budget exhausted",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Consecutive failed reconnects allowed before giving up; 0 retries while wanted.
    pub max_reconnect_attempts: u32,
    pub frame_pacing: Duration,
    pub camera_check_interval: Duration,
    pub jpeg_quality: u8,
    pub snapshot_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            frame_pacing: Duration::from_millis(33),
            camera_check_interval: Duration::from_secs(5),
            jpeg_quality: 80,
            snapshot_interval: Duration::from_secs(300),
        }
    }
}

/// Called once when the worker thread exits: `(camera, session)`.
pub type ExitHook = Box<dyn FnOnce(&CameraId, u64) + Send>;

/// First stop request wins; sleeps in the worker wake up as soon as one arrives.
struct StopSignal {
    reason: Mutex<Option<StopReason>>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn request(&self, reason: StopReason) -> bool {
        let mut guard = match self.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let first = guard.is_none();
        if first {
            *guard = Some(reason);
        }
        self.cond.notify_all();
        first
    }

    fn reason(&self) -> Option<StopReason> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep up to `timeout`; returns early with the reason if a stop arrives.
    fn wait(&self, timeout: Duration) -> Option<StopReason> {
        let guard = match self.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() || timeout.is_zero() {
            return *guard;
        }
        match self
            .cond
            .wait_timeout_while(guard, timeout, |reason| reason.is_none())
        {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

struct Status {
    state: WorkerState,
    history: VecDeque<WorkerState>,
    reconnect_attempts: u32,
    last_frame_at: Option<Instant>,
    frames_processed: u64,
}

struct Shared {
    camera: CameraId,
    session: u64,
    cache: FrameCache,
    status: Mutex<Status>,
    status_changed: Condvar,
    last_access: Mutex<Instant>,
    stop: StopSignal,
    finished: AtomicBool,
}

impl Shared {
    fn with_status<T>(&self, f: impl FnOnce(&mut Status) -> T) -> Result<T> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| anyhow!("worker status lock poisoned"))?;
        Ok(f(&mut status))
    }

    fn set_state(&self, state: WorkerState) {
        let changed = self.with_status(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            if status.history.len() == HISTORY_LIMIT {
                status.history.pop_front();
            }
            status.history.push_back(state);
            true
        });
        match changed {
            Ok(true) => {
                log::debug!("worker[{}#{}]: -> {:?}", self.camera, self.session, state);
                self.status_changed.notify_all();
            }
            Ok(false) => {}
            Err(err) => log::error!("worker[{}]: {}", self.camera, err),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_access.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Signal stop and drop the cached frame. Idempotent.
    fn teardown(&self, reason: StopReason) {
        if self.stop.request(reason) {
            log::info!(
                "worker[{}#{}]: stop requested ({})",
                self.camera,
                self.session,
                reason
            );
        }
        if let Err(err) = self.cache.clear() {
            log::error!("worker[{}]: {}", self.camera, err);
        }
        self.status_changed.notify_all();
    }
}

/// Cloneable reference to a running (or finished) worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerHandle {
    /// Start a worker thread for `camera`. The source must be unconnected; the thread
    /// connects it.
    pub fn spawn(
        camera: CameraId,
        session: u64,
        source: Box<dyn FrameSource>,
        pipeline: DetectionPipeline,
        store: SharedStore,
        settings: WorkerSettings,
        on_exit: ExitHook,
    ) -> Result<Self> {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            camera: camera.clone(),
            session,
            cache: FrameCache::new(),
            status: Mutex::new(Status {
                state: WorkerState::Disconnected,
                history: VecDeque::from([WorkerState::Disconnected]),
                reconnect_attempts: 0,
                last_frame_at: None,
                frames_processed: 0,
            }),
            status_changed: Condvar::new(),
            last_access: Mutex::new(now),
            stop: StopSignal::new(),
            finished: AtomicBool::new(false),
        });

        let worker = StreamWorker {
            shared: Arc::clone(&shared),
            scheduler: PersistenceScheduler::new(settings.snapshot_interval, now),
            next_camera_check: now + settings.camera_check_interval,
            source,
            pipeline,
            store,
            settings,
        };
        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", camera))
            .spawn(move || worker.run(on_exit))
            .with_context(|| format!("failed to spawn worker thread for {}", camera))?;

        Ok(Self {
            shared,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.shared.camera
    }

    /// Registry-assigned session number; distinct for every worker instance.
    pub fn session(&self) -> u64 {
        self.shared.session
    }

    /// Latest processed frame, if any. Counts as activity for idle tracking.
    pub fn latest(&self) -> Result<Option<Arc<FrameCacheEntry>>> {
        self.shared.touch();
        self.shared.cache.latest()
    }

    pub fn touch(&self) {
        self.shared.touch();
    }

    pub fn state(&self) -> WorkerState {
        self.shared
            .with_status(|status| status.state)
            .unwrap_or(WorkerState::Disconnected)
    }

    /// Recent state transitions, oldest first.
    pub fn history(&self) -> Vec<WorkerState> {
        self.shared
            .with_status(|status| status.history.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared
            .with_status(|status| status.reconnect_attempts)
            .unwrap_or(0)
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.shared
            .with_status(|status| status.last_frame_at)
            .unwrap_or(None)
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared
            .with_status(|status| status.frames_processed)
            .unwrap_or(0)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.stop.reason()
    }

    /// Running and not asked to stop.
    pub fn is_alive(&self) -> bool {
        !self.shared.finished.load(Ordering::SeqCst) && self.shared.stop.reason().is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop and clear its cache. Idempotent; does not wait.
    pub fn stop(&self, reason: StopReason) {
        self.shared.teardown(reason);
    }

    /// Wait until the worker has left `Connecting` (or finished), up to `timeout`.
    /// Returns the state observed last.
    pub fn wait_until_settled(&self, timeout: Duration) -> WorkerState {
        let deadline = Instant::now() + timeout;
        let Ok(mut status) = self.shared.status.lock() else {
            return WorkerState::Disconnected;
        };
        loop {
            let finished = self.shared.finished.load(Ordering::SeqCst);
            let pending = matches!(
                status.state,
                WorkerState::Connecting | WorkerState::Disconnected
            );
            if finished || !pending {
                return status.state;
            }
            let now = Instant::now();
            if now >= deadline {
                return status.state;
            }
            status = match self.shared.status_changed.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return WorkerState::Disconnected,
            };
        }
    }

    /// Wait up to `timeout` for the worker thread to finish. Returns whether it did.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut status) = self.shared.status.lock() else {
            return self.is_finished();
        };
        loop {
            if self.shared.finished.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(FINISH_POLL);
            status = match self.shared.status_changed.wait_timeout(status, slice) {
                Ok((guard, _)) => guard,
                Err(_) => return self.is_finished(),
            };
        }
    }

    /// Block until the worker thread exits. Call `stop` first.
    pub fn join(&self) -> Result<()> {
        let thread = self
            .thread
            .lock()
            .map_err(|_| anyhow!("worker thread lock poisoned"))?
            .take();
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|_| anyhow!("worker thread for {} panicked", self.shared.camera))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("camera", &self.shared.camera)
            .field("session", &self.shared.session)
            .field("state", &self.state())
            .finish()
    }
}

struct StreamWorker {
    shared: Arc<Shared>,
    source: Box<dyn FrameSource>,
    pipeline: DetectionPipeline,
    store: SharedStore,
    settings: WorkerSettings,
    scheduler: PersistenceScheduler,
    next_camera_check: Instant,
}

impl StreamWorker {
    fn run(mut self, on_exit: ExitHook) {
        let camera = self.shared.camera.clone();
        let session = self.shared.session;
        log::info!(
            "worker[{}#{}]: starting for {}",
            camera,
            session,
            self.source.describe()
        );

        let reason = self.run_loop();

        self.source.release();
        self.shared.teardown(reason);
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.set_state(WorkerState::Disconnected);
        log::info!(
            "worker[{}#{}]: stopped ({}); {} unique ids this session",
            camera,
            session,
            reason,
            self.pipeline.total_unique()
        );
        on_exit(&camera, session);
    }

    fn run_loop(&mut self) -> StopReason {
        self.shared.set_state(WorkerState::Connecting);
        match self.source.connect() {
            Ok(()) => self.shared.set_state(WorkerState::Streaming),
            Err(err) => {
                log::warn!("worker[{}]: connect failed: {:#}", self.shared.camera, err);
                if let Some(reason) = self.reconnect() {
                    return reason;
                }
            }
        }

        loop {
            if let Some(reason) = self.shared.stop.reason() {
                return reason;
            }
            if let Some(reason) = self.check_wanted() {
                return reason;
            }

            match self.source.read_frame() {
                Ok(frame) => self.handle_frame(frame),
                Err(err) => {
                    log::warn!("worker[{}]: read failed: {:#}", self.shared.camera, err);
                    if let Some(reason) = self.reconnect() {
                        return reason;
                    }
                    continue;
                }
            }

            if let Some(reason) = self.shared.stop.wait(self.settings.frame_pacing) {
                return reason;
            }
        }
    }

    /// Idle and camera-record checks. A stop reason means the worker must exit.
    fn check_wanted(&mut self) -> Option<StopReason> {
        if self.shared.idle_for() >= self.settings.idle_timeout {
            self.shared.stop.request(StopReason::Idle);
            return Some(StopReason::Idle);
        }

        let now = Instant::now();
        if now < self.next_camera_check {
            return None;
        }
        self.next_camera_check = now + self.settings.camera_check_interval;
        let active = self
            .store
            .lock()
            .map_err(|_| anyhow!("count store lock poisoned"))
            .and_then(|mut store| store.camera_active(&self.shared.camera));
        match active {
            Ok(Some(true)) => None,
            Ok(_) => {
                self.shared.stop.request(StopReason::CameraRemoved);
                Some(StopReason::CameraRemoved)
            }
            Err(err) => {
                log::warn!(
                    "worker[{}]: camera record check failed: {:#}",
                    self.shared.camera,
                    err
                );
                None
            }
        }
    }

    /// Release and re-open the source with exponential backoff. `None` means streaming
    /// resumed; `Some` means give up.
    fn reconnect(&mut self) -> Option<StopReason> {
        self.shared.set_state(WorkerState::Reconnecting);
        self.source.release();
        let mut delay = self.settings.reconnect_initial;

        loop {
            let attempts = self
                .shared
                .with_status(|status| status.reconnect_attempts)
                .unwrap_or(0);
            let budget = self.settings.max_reconnect_attempts;
            if budget > 0 && attempts >= budget {
                log::error!(
                    "worker[{}]: giving up after {} reconnect attempts",
                    self.shared.camera,
                    attempts
                );
                self.shared.stop.request(StopReason::ReconnectBudgetExhausted);
                return Some(StopReason::ReconnectBudgetExhausted);
            }
            if let Some(reason) = self.shared.stop.wait(delay) {
                return Some(reason);
            }
            if self.shared.idle_for() >= self.settings.idle_timeout {
                self.shared.stop.request(StopReason::Idle);
                return Some(StopReason::Idle);
            }

            let attempt = attempts + 1;
            let _ = self
                .shared
                .with_status(|status| status.reconnect_attempts = attempt);
            log::info!(
                "worker[{}]: reconnect attempt {} to {}",
                self.shared.camera,
                attempt,
                self.source.describe()
            );
            match self.source.connect() {
                Ok(()) => {
                    self.shared.set_state(WorkerState::Streaming);
                    return None;
                }
                Err(err) => {
                    log::warn!(
                        "worker[{}]: reconnect attempt {} failed: {:#}",
                        self.shared.camera,
                        attempt,
                        err
                    );
                    delay = (delay * 2).min(self.settings.reconnect_max);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let camera = &self.shared.camera;
        let _ = self.shared.with_status(|status| {
            status.reconnect_attempts = 0;
            status.last_frame_at = Some(frame.captured_at);
            status.frames_processed += 1;
        });

        if let Some(output) = self.pipeline.process(&frame, camera) {
            match encode_jpeg(&output.frame, self.settings.jpeg_quality) {
                Ok(jpeg) => {
                    if let Err(err) =
                        self.shared
                            .cache
                            .publish(jpeg, output.current_count, output.total_unique)
                    {
                        log::error!("worker[{}]: {}", camera, err);
                    }
                }
                Err(err) => log::warn!(
                    "worker[{}]: {}",
                    camera,
                    FootfallError::Decode(format!("frame dropped: {:#}", err))
                ),
            }
        }

        if self.scheduler.poll(Instant::now()) {
            if let Err(err) = self.persist_snapshot() {
                log::warn!("worker[{}]: {:#}", camera, err);
            }
        }
    }

    fn persist_snapshot(&self) -> Result<()> {
        let Some(entry) = self.shared.cache.latest()? else {
            log::debug!(
                "worker[{}]: snapshot skipped, no frame processed yet",
                self.shared.camera
            );
            return Ok(());
        };
        let snapshot = CountSnapshot {
            camera_id: self.shared.camera.clone(),
            current_count: entry.current_count,
            total_unique: entry.total_unique,
            timestamp: now_s()?,
        };
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("count store lock poisoned"))?;
        store
            .save(&snapshot)
            .map_err(|err| FootfallError::Persistence(format!("{:#}", err)))?;
        log::debug!(
            "worker[{}]: snapshot saved (count={}, total={})",
            self.shared.camera,
            snapshot.current_count,
            snapshot.total_unique
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Annotator;
    use crate::detect::StubDetector;
    use crate::ingest::{SyntheticConfig, SyntheticSource};
    use crate::storage::{shared_store, CameraRecord, CountStore, InMemoryCountStore};
    use crate::track::IouTracker;
    use std::sync::mpsc;

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            idle_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            max_reconnect_attempts: 3,
            frame_pacing: Duration::from_millis(5),
            camera_check_interval: Duration::from_millis(20),
            jpeg_quality: 70,
            snapshot_interval: Duration::from_secs(300),
        }
    }

    fn pipeline() -> DetectionPipeline {
        DetectionPipeline::new(
            Box::new(StubDetector::new()),
            Box::new(IouTracker::default()),
            Arc::new(Annotator::boxes_only()),
            0.25,
            100,
        )
    }

    fn start(
        url: &str,
        store: SharedStore,
        settings: WorkerSettings,
    ) -> (WorkerHandle, mpsc::Receiver<u64>) {
        let camera = CameraId::from_url(url).unwrap();
        store
            .lock()
            .unwrap()
            .ensure_camera(&CameraRecord::new(camera.clone(), url, None))
            .unwrap();
        let source = SyntheticSource::new(SyntheticConfig::from_url(url).unwrap());
        let (tx, rx) = mpsc::channel();
        let handle = WorkerHandle::spawn(
            camera,
            1,
            Box::new(source),
            pipeline(),
            store,
            settings,
            Box::new(move |_, session| {
                let _ = tx.send(session);
            }),
        )
        .unwrap();
        (handle, rx)
    }

    fn wait_for_frame(handle: &WorkerHandle) -> Arc<FrameCacheEntry> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = handle.latest().unwrap() {
                return entry;
            }
            assert!(Instant::now() < deadline, "no frame produced");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn streams_frames_and_stops_on_request() {
        let store = shared_store(InMemoryCountStore::new());
        let (handle, exits) = start("stub://worker-a?width=32&height=24", store, fast_settings());
        let entry = wait_for_frame(&handle);
        assert_eq!(&entry.encoded_frame[..2], &[0xFF, 0xD8]);
        assert_eq!(handle.state(), WorkerState::Streaming);

        handle.stop(StopReason::Released);
        handle.join().unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.state(), WorkerState::Disconnected);
        assert!(handle.latest().unwrap().is_none());
        assert_eq!(handle.stop_reason(), Some(StopReason::Released));
        assert_eq!(exits.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        // Teardown is idempotent.
        handle.stop(StopReason::Shutdown);
        assert_eq!(handle.stop_reason(), Some(StopReason::Released));
    }

    #[test]
    fn reconnects_after_failed_first_connect() {
        let store = shared_store(InMemoryCountStore::new());
        let (handle, _exits) = start(
            "stub://worker-b?fail_connects=1&width=16&height=16",
            store,
            fast_settings(),
        );
        wait_for_frame(&handle);
        assert_eq!(
            handle.history(),
            vec![
                WorkerState::Disconnected,
                WorkerState::Connecting,
                WorkerState::Reconnecting,
                WorkerState::Streaming
            ]
        );
        // A delivered frame resets the consecutive-attempt counter.
        assert_eq!(handle.reconnect_attempts(), 0);
        handle.stop(StopReason::Released);
        handle.join().unwrap();
    }

    #[test]
    fn gives_up_when_reconnect_budget_is_spent() {
        let store = shared_store(InMemoryCountStore::new());
        let (handle, exits) = start(
            "stub://worker-c?fail_connects=100",
            store,
            fast_settings(),
        );
        exits.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(
            handle.stop_reason(),
            Some(StopReason::ReconnectBudgetExhausted)
        );
        assert_eq!(handle.reconnect_attempts(), 3);
    }

    #[test]
    fn stops_when_camera_is_deactivated() {
        let store = shared_store(InMemoryCountStore::new());
        let (handle, exits) = start("stub://worker-d?width=8&height=8", store.clone(), fast_settings());
        wait_for_frame(&handle);
        store
            .lock()
            .unwrap()
            .set_camera_active(handle.camera_id(), false)
            .unwrap();
        exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.stop_reason(), Some(StopReason::CameraRemoved));
    }

    #[test]
    fn stops_when_nobody_reads() {
        let store = shared_store(InMemoryCountStore::new());
        let settings = WorkerSettings {
            idle_timeout: Duration::from_millis(100),
            ..fast_settings()
        };
        let (handle, exits) = start("stub://worker-e?width=8&height=8", store, settings);
        exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.stop_reason(), Some(StopReason::Idle));
    }

    #[test]
    fn stop_signal_wakes_sleepers() {
        let signal = Arc::new(StopSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.wait(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(signal.request(StopReason::Shutdown));
        assert!(!signal.request(StopReason::Idle));
        assert_eq!(waiter.join().unwrap(), Some(StopReason::Shutdown));
    }
}
