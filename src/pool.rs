//! The application pool
//!
//! A process-wide registry of spawned worker instances, keyed by application
//! root. `get` hands out a [`Session`] backed by an idle worker when one
//! matches, and otherwise admits a spawn under the global and per-application
//! caps: per-key callers queue FIFO when their application is at its cap, the
//! globally least-recently-used idle worker is evicted when the pool is full,
//! and concurrent first-time requests for the same application coalesce into
//! a single spawn. A background sweeper retires workers that sit idle past
//! the configured limit, and a newer mtime on `tmp/restart.txt` retires every
//! worker of that application before the request proceeds.
//!
//! All shared state lives behind one mutex with short critical sections; the
//! lock is never held across an await point. Workers released by a session
//! are handed directly to the oldest queued waiter so FIFO service order
//! cannot be broken by a newly arriving request.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::GatewayError;
use crate::session::Session;
use crate::spawn::Spawner;
use crate::worker::{AppKey, Endpoint, SpawnOptions, Worker};

/// Caps and timings for a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Hard limit on workers across all applications.
    pub max_pool: usize,
    /// Hard limit on workers per application. 0 disables the cap.
    pub max_per_app: usize,
    /// How long a worker may sit idle before the sweeper retires it.
    pub max_idle: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_pool: 6,
            max_per_app: 0,
            max_idle: Duration::from_secs(120),
        }
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        PoolSettings {
            max_pool: config.max_pool,
            max_per_app: config.max_per_app,
            max_idle: config.max_idle(),
        }
    }
}

/// The pool interface the dispatcher is written against.
///
/// `clear` and the introspection methods exist for tests; the cap setters
/// take effect immediately for admission while excess workers are retired
/// lazily as they become idle.
pub trait ApplicationPool: Send + Sync + 'static {
    /// Open a session with the application at `key`, reusing an idle worker
    /// or spawning a new one.
    fn get(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> impl std::future::Future<Output = Result<Session, GatewayError>> + Send;

    /// Retire every idle worker and invalidate outstanding checkouts.
    fn clear(&self);

    fn set_max(&self, max: usize);
    fn set_max_per_app(&self, max: usize);
    fn set_max_idle_seconds(&self, secs: u64);

    /// Number of workers currently serving a session.
    fn active(&self) -> usize;
    /// Number of workers in the pool, busy or idle.
    fn count(&self) -> usize;
    fn spawn_server_pid(&self) -> Option<u32>;
}

impl<P: ApplicationPool> ApplicationPool for Arc<P> {
    fn get(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> impl std::future::Future<Output = Result<Session, GatewayError>> + Send {
        (**self).get(key, options)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn set_max(&self, max: usize) {
        (**self).set_max(max)
    }

    fn set_max_per_app(&self, max: usize) {
        (**self).set_max_per_app(max)
    }

    fn set_max_idle_seconds(&self, secs: u64) {
        (**self).set_max_idle_seconds(secs)
    }

    fn active(&self) -> usize {
        (**self).active()
    }

    fn count(&self) -> usize {
        (**self).count()
    }

    fn spawn_server_pid(&self) -> Option<u32> {
        (**self).spawn_server_pid()
    }
}

/// What a releasing session passes to the oldest queued waiter.
enum Handoff {
    /// The released worker itself, already marked busy for the waiter.
    Worker(Worker),
    /// A freed capacity slot; the waiter re-runs admission.
    Capacity,
}

/// One queued `get` waiting for a worker of its application.
struct WaitSlot {
    notify: Notify,
    options: SpawnOptions,
    handoff: Mutex<Option<Handoff>>,
}

/// Per-application pool state.
#[derive(Default)]
struct Group {
    /// Idle workers ordered by last use, most recently used at the back.
    idle: Vec<Worker>,
    /// Workers currently checked out to a session.
    active: usize,
    /// Capacity reserved for an in-flight spawn.
    reserved: usize,
    spawning: bool,
    /// Bumped by restarts and `clear`; stale checkouts retire on release.
    generation: u64,
    /// Broadcast when an in-flight spawn finishes, success or not.
    spawn_done: Arc<Notify>,
    /// FIFO queue of callers blocked on the per-application cap.
    waiters: VecDeque<Arc<WaitSlot>>,
}

impl Group {
    fn population(&self) -> usize {
        self.idle.len() + self.active + self.reserved
    }

    fn prunable(&self) -> bool {
        self.population() == 0 && self.waiters.is_empty() && !self.spawning
    }
}

struct PoolState {
    groups: HashMap<AppKey, Group>,
    /// Last observed mtime of each application's `tmp/restart.txt`.
    restart_stamps: HashMap<AppKey, SystemTime>,
    max_pool: usize,
    max_per_app: usize,
    max_idle: Duration,
}

impl PoolState {
    fn total(&self) -> usize {
        self.groups.values().map(Group::population).sum()
    }

    fn active(&self) -> usize {
        self.groups.values().map(|g| g.active).sum()
    }

    fn prune(&mut self, key: &AppKey) {
        if self.groups.get(key).is_some_and(Group::prunable) {
            self.groups.remove(key);
        }
    }

    /// Evict the globally least-recently-used idle worker. Returns false when
    /// nothing idle is evictable.
    fn evict_lru(&mut self) -> bool {
        let lru_key = self
            .groups
            .iter()
            .filter_map(|(key, group)| {
                group.idle.first().map(|w| (key.clone(), w.last_used_at))
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(key, _)| key);

        let Some(key) = lru_key else { return false };
        let group = self.groups.get_mut(&key).expect("group had an idle worker");
        let worker = group.idle.remove(0);
        debug!(key = %key, pid = worker.pid, "Evicted least recently used idle worker");
        self.prune(&key);
        true
    }
}

/// State shared between the pool, its checkouts, and the sweeper.
pub(crate) struct PoolCore {
    state: Mutex<PoolState>,
}

impl PoolCore {
    /// Return a worker after its session ends. Healthy workers go to the
    /// oldest queued waiter or back to the idle list; unhealthy and stale
    /// ones are retired. Runs synchronously so drop guards can call it.
    fn release(&self, mut worker: Worker, healthy: bool) {
        let key = worker.key.clone();
        let mut state = self.state.lock();

        let Some(group) = state.groups.get_mut(&key) else {
            // The application was cleared while the session ran.
            return;
        };
        group.active -= 1;
        worker.sessions = 0;

        let stale = worker.generation != group.generation;
        if stale || !healthy {
            debug!(key = %key, pid = worker.pid, stale, healthy, "Retiring worker");
            notify_capacity(group);
            state.prune(&key);
            return;
        }

        // Lowered caps retire excess workers as they become idle.
        let max_pool = state.max_pool;
        let max_per_app = state.max_per_app;
        let total_without_worker = state.total();
        let group = state.groups.get_mut(&key).expect("group checked above");
        let over_global = total_without_worker + 1 > max_pool;
        let over_per_app = max_per_app != 0 && group.population() + 1 > max_per_app;
        if over_global || over_per_app {
            debug!(key = %key, pid = worker.pid, "Retiring worker released over lowered caps");
            notify_capacity(group);
            state.prune(&key);
            return;
        }

        worker.touch();
        if let Some(slot) = group.waiters.pop_front() {
            if slot.options == worker.options {
                // Direct handoff keeps FIFO service order: the worker never
                // becomes visible to newer callers.
                worker.sessions = 1;
                group.active += 1;
                *slot.handoff.lock() = Some(Handoff::Worker(worker));
            } else {
                group.idle.push(worker);
                *slot.handoff.lock() = Some(Handoff::Capacity);
            }
            slot.notify.notify_one();
            return;
        }
        group.idle.push(worker);
    }

    fn sweep_interval(&self) -> Duration {
        let state = self.state.lock();
        (state.max_idle / 4)
            .min(Duration::from_secs(30))
            .max(Duration::from_secs(1))
    }

    /// Retire idle workers that outlived the idle limit.
    fn sweep_idle(&self) {
        let mut state = self.state.lock();
        let max_idle = state.max_idle;
        let now = Instant::now();
        let mut retired = 0usize;
        for group in state.groups.values_mut() {
            let before = group.idle.len();
            group
                .idle
                .retain(|w| now.duration_since(w.last_used_at) <= max_idle);
            retired += before - group.idle.len();
        }
        let empty: Vec<AppKey> = state
            .groups
            .iter()
            .filter(|(_, g)| g.prunable())
            .map(|(k, _)| k.clone())
            .collect();
        for key in empty {
            state.groups.remove(&key);
        }
        if retired > 0 {
            debug!(retired, "Idle sweep retired workers");
        }
    }
}

fn notify_capacity(group: &mut Group) {
    if let Some(slot) = group.waiters.pop_front() {
        *slot.handoff.lock() = Some(Handoff::Capacity);
        slot.notify.notify_one();
    }
}

/// A worker checked out of the pool for one session.
///
/// Dropping the checkout returns the worker healthy; `release(false)` retires
/// it. The session owns exactly one checkout, so a worker serves at most one
/// session at a time.
pub(crate) struct Checkout {
    core: Option<Arc<PoolCore>>,
    worker: Option<Worker>,
}

impl Checkout {
    fn pooled(core: Arc<PoolCore>, worker: Worker) -> Self {
        Checkout {
            core: Some(core),
            worker: Some(worker),
        }
    }

    /// A checkout with no backing pool; releasing is a no-op. Test use.
    #[cfg(test)]
    pub(crate) fn orphan(worker: Worker) -> Self {
        Checkout {
            core: None,
            worker: Some(worker),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.worker.as_ref().map_or(0, |w| w.pid)
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.worker
            .as_ref()
            .expect("checkout holds a worker until released")
            .endpoint
            .clone()
    }

    pub(crate) fn release(&mut self, healthy: bool) {
        if let Some(worker) = self.worker.take() {
            if let Some(core) = &self.core {
                core.release(worker, healthy);
            }
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.release(true);
    }
}

/// What one admission pass decided, computed under the state lock.
enum Step {
    Ready(Worker),
    WaitSpawn(Arc<Notify>),
    WaitIdle(Arc<WaitSlot>),
    Spawn,
    Busy,
}

/// The in-process pool implementation.
pub struct StandardPool<S> {
    core: Arc<PoolCore>,
    spawner: S,
}

impl<S: Spawner> StandardPool<S> {
    /// Create a pool and start its idle sweeper.
    pub fn new(spawner: S, settings: PoolSettings) -> Arc<Self> {
        let core = Arc::new(PoolCore {
            state: Mutex::new(PoolState {
                groups: HashMap::new(),
                restart_stamps: HashMap::new(),
                max_pool: settings.max_pool,
                max_per_app: settings.max_per_app,
                max_idle: settings.max_idle,
            }),
        });
        spawn_sweeper(&core);
        Arc::new(StandardPool { core, spawner })
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    async fn do_get(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> Result<Session, GatewayError> {
        self.check_restart(key).await;
        let worker = self.acquire(key, options).await?;
        let checkout = Checkout::pooled(self.core.clone(), worker);
        Session::open(checkout).await
    }

    /// Observe `tmp/restart.txt` at most once per get: a newer mtime than the
    /// stored stamp retires the application's idle workers and invalidates
    /// its outstanding checkouts. The file is never deleted.
    async fn check_restart(&self, key: &AppKey) {
        let restart_file = key.restart_file();
        let mtime = match tokio::fs::metadata(&restart_file).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(file = %restart_file.display(), error = %e, "Cannot stat restart file");
                None
            }
        };
        let Some(mtime) = mtime else { return };

        let mut state = self.core.state.lock();
        let due = state
            .restart_stamps
            .get(key)
            .is_none_or(|stamp| mtime > *stamp);
        if !due {
            return;
        }
        state.restart_stamps.insert(key.clone(), mtime);
        if let Some(group) = state.groups.get_mut(key) {
            let dropped = group.idle.len();
            group.idle.clear();
            group.generation += 1;
            info!(key = %key, dropped, "Restart signal observed, retiring workers");
            state.prune(key);
        }
    }

    async fn acquire(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> Result<Worker, GatewayError> {
        loop {
            let step = self.admission_step(key, options);
            match step {
                Step::Ready(worker) => return Ok(worker),
                Step::Busy => return Err(GatewayError::Busy),
                Step::WaitSpawn(notify) => {
                    // Register interest before re-checking so a spawn that
                    // finishes in between still wakes us.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let still_spawning = {
                        let state = self.core.state.lock();
                        state.groups.get(key).is_some_and(|g| g.spawning)
                    };
                    if still_spawning {
                        notified.await;
                    }
                }
                Step::WaitIdle(slot) => {
                    match self.wait_for_handoff(key, slot).await {
                        Some(Handoff::Worker(worker)) => return Ok(worker),
                        Some(Handoff::Capacity) | None => {}
                    }
                }
                Step::Spawn => return self.spawn_worker(key, options).await,
            }
        }
    }

    /// One pass over the admission rules, entirely under the state lock.
    fn admission_step(&self, key: &AppKey, options: &SpawnOptions) -> Step {
        let mut state = self.core.state.lock();
        let max_per_app = state.max_per_app;
        let max_pool = state.max_pool;
        state.groups.entry(key.clone()).or_default();

        // Reuse the most recently used idle worker with matching options.
        {
            let group = state.groups.get_mut(key).expect("group inserted above");
            if let Some(ix) = group.idle.iter().rposition(|w| w.matches(options)) {
                let mut worker = group.idle.remove(ix);
                worker.sessions = 1;
                worker.touch();
                group.active += 1;
                return Step::Ready(worker);
            }
            if group.spawning {
                return Step::WaitSpawn(group.spawn_done.clone());
            }
        }

        // Per-application cap: queue behind the busy workers, except when the
        // cap is filled by idle workers with different spawn options, which
        // are not interchangeable and would never be released. Retire the
        // oldest of those instead.
        {
            let group = state.groups.get_mut(key).expect("group inserted above");
            while max_per_app != 0 && group.population() >= max_per_app {
                if group.idle.is_empty() {
                    let slot = Arc::new(WaitSlot {
                        notify: Notify::new(),
                        options: options.clone(),
                        handoff: Mutex::new(None),
                    });
                    group.waiters.push_back(slot.clone());
                    return Step::WaitIdle(slot);
                }
                let retired = group.idle.remove(0);
                debug!(
                    key = %key,
                    pid = retired.pid,
                    "Retiring idle worker whose spawn options no longer match"
                );
            }
        }

        // Global cap: evict globally least-recently-used idle workers.
        while state.total() >= max_pool {
            if !state.evict_lru() {
                return Step::Busy;
            }
        }

        let group = state.groups.entry(key.clone()).or_default();
        group.spawning = true;
        group.reserved += 1;
        Step::Spawn
    }

    async fn spawn_worker(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> Result<Worker, GatewayError> {
        let result = self.spawner.spawn(key, options).await;

        let mut state = self.core.state.lock();
        let group = state
            .groups
            .get_mut(key)
            .expect("group persists while a spawn is in flight");
        group.spawning = false;
        group.reserved -= 1;
        group.spawn_done.notify_waiters();

        match result {
            Ok(mut worker) => {
                worker.sessions = 1;
                worker.generation = group.generation;
                worker.touch();
                group.active += 1;
                debug!(key = %key, pid = worker.pid, endpoint = %worker.endpoint, "Installed new worker");
                Ok(worker)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Spawn failed");
                notify_capacity(group);
                state.prune(key);
                Err(GatewayError::Spawn(e))
            }
        }
    }

    /// Wait for a released worker or freed capacity. A caller cancelled
    /// mid-wait unregisters itself; a handoff it already received is passed
    /// on so the worker or the capacity is not lost.
    async fn wait_for_handoff(&self, key: &AppKey, slot: Arc<WaitSlot>) -> Option<Handoff> {
        struct WaitGuard<'a> {
            core: &'a Arc<PoolCore>,
            key: &'a AppKey,
            slot: &'a Arc<WaitSlot>,
            armed: bool,
        }

        impl Drop for WaitGuard<'_> {
            fn drop(&mut self) {
                if !self.armed {
                    return;
                }
                let handoff = {
                    let mut state = self.core.state.lock();
                    if let Some(group) = state.groups.get_mut(self.key) {
                        if let Some(ix) = group
                            .waiters
                            .iter()
                            .position(|w| Arc::ptr_eq(w, self.slot))
                        {
                            group.waiters.remove(ix);
                            return;
                        }
                    }
                    self.slot.handoff.lock().take()
                };
                match handoff {
                    Some(Handoff::Worker(worker)) => self.core.release(worker, true),
                    Some(Handoff::Capacity) => {
                        let mut state = self.core.state.lock();
                        if let Some(group) = state.groups.get_mut(self.key) {
                            notify_capacity(group);
                        }
                    }
                    None => {}
                }
            }
        }

        let mut guard = WaitGuard {
            core: &self.core,
            key,
            slot: &slot,
            armed: true,
        };
        slot.notify.notified().await;
        guard.armed = false;
        slot.handoff.lock().take()
    }
}

impl<S: Spawner> ApplicationPool for StandardPool<S> {
    fn get(
        &self,
        key: &AppKey,
        options: &SpawnOptions,
    ) -> impl std::future::Future<Output = Result<Session, GatewayError>> + Send {
        self.do_get(key, options)
    }

    fn clear(&self) {
        let mut state = self.core.state.lock();
        let mut keys_to_remove = Vec::new();
        for (key, group) in state.groups.iter_mut() {
            group.idle.clear();
            group.generation += 1;
            if group.prunable() {
                keys_to_remove.push(key.clone());
            } else {
                // Waiters will re-run admission against the emptied group.
                while let Some(slot) = group.waiters.pop_front() {
                    *slot.handoff.lock() = Some(Handoff::Capacity);
                    slot.notify.notify_one();
                }
            }
        }
        for key in keys_to_remove {
            state.groups.remove(&key);
        }
        info!("Application pool cleared");
    }

    fn set_max(&self, max: usize) {
        self.core.state.lock().max_pool = max;
    }

    fn set_max_per_app(&self, max: usize) {
        self.core.state.lock().max_per_app = max;
    }

    fn set_max_idle_seconds(&self, secs: u64) {
        self.core.state.lock().max_idle = Duration::from_secs(secs);
    }

    fn active(&self) -> usize {
        self.core.state.lock().active()
    }

    fn count(&self) -> usize {
        self.core.state.lock().total()
    }

    fn spawn_server_pid(&self) -> Option<u32> {
        self.spawner.spawn_server_pid()
    }
}

fn spawn_sweeper(core: &Arc<PoolCore>) {
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        loop {
            let interval = match weak.upgrade() {
                Some(core) => core.sweep_interval(),
                None => return,
            };
            tokio::time::sleep(interval).await;
            match weak.upgrade() {
                Some(core) => core.sweep_idle(),
                None => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpawnError;
    use crate::message::{read_scalar, serialize_headers};
    use crate::worker::{AppType, SpawnMethod};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Spawner that backs each worker with a real Unix socket echoing a
    /// canned CGI response after the request is half-closed.
    struct MockSpawner {
        dir: tempfile::TempDir,
        next_id: AtomicU32,
        spawn_count: AtomicUsize,
        fail_spawns: AtomicBool,
        dead_endpoints: AtomicBool,
        requests: Mutex<Vec<(AppKey, SpawnOptions)>>,
    }

    impl MockSpawner {
        fn new() -> Self {
            MockSpawner {
                dir: tempfile::TempDir::new().unwrap(),
                next_id: AtomicU32::new(1),
                spawn_count: AtomicUsize::new(0),
                fail_spawns: AtomicBool::new(false),
                dead_endpoints: AtomicBool::new(false),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn spawn_count(&self) -> usize {
            self.spawn_count.load(Ordering::SeqCst)
        }
    }

    impl Spawner for MockSpawner {
        fn spawn(
            &self,
            key: &AppKey,
            options: &SpawnOptions,
        ) -> impl std::future::Future<Output = Result<Worker, SpawnError>> + Send {
            async move {
                self.spawn_count.fetch_add(1, Ordering::SeqCst);
                self.requests.lock().push((key.clone(), options.clone()));
                if self.fail_spawns.load(Ordering::SeqCst) {
                    return Err(SpawnError::new("mock spawn failure"));
                }
                // Give coalescing tests a window in which the spawn is in
                // flight.
                tokio::time::sleep(Duration::from_millis(20)).await;

                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let path = self.dir.path().join(format!("worker-{id}.sock"));
                if !self.dead_endpoints.load(Ordering::SeqCst) {
                    let listener = UnixListener::bind(&path)
                        .map_err(|e| SpawnError::new(format!("bind: {e}")))?;
                    tokio::spawn(async move {
                        while let Ok((mut stream, _)) = listener.accept().await {
                            let (mut reader, mut writer) = stream.split();
                            if read_scalar(&mut reader).await.is_err() {
                                continue;
                            }
                            let mut body = Vec::new();
                            let _ = reader.read_to_end(&mut body).await;
                            let _ = writer
                                .write_all(b"Status: 200 OK\r\n\r\nhello world")
                                .await;
                            let _ = writer.shutdown().await;
                        }
                    });
                }
                Ok(Worker::new(
                    key.clone(),
                    options.clone(),
                    10_000 + id,
                    Endpoint::Unix(path),
                ))
            }
        }

        fn spawn_server_pid(&self) -> Option<u32> {
            Some(999)
        }
    }

    fn options() -> SpawnOptions {
        SpawnOptions {
            lower_privilege: true,
            fallback_user: "nobody".to_string(),
            environment: "production".to_string(),
            spawn_method: SpawnMethod::Smart,
            app_type: AppType::Rails,
        }
    }

    fn pool_with(settings: PoolSettings) -> Arc<StandardPool<MockSpawner>> {
        StandardPool::new(MockSpawner::new(), settings)
    }

    async fn use_session(session: &mut Session) -> Vec<u8> {
        session
            .send_headers(&serialize_headers([("REQUEST_METHOD", "GET")]))
            .await
            .unwrap();
        session.shutdown_writer().await.unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = session.read_response(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn cold_start_spawns_exactly_once() {
        let pool = pool_with(PoolSettings {
            max_pool: 4,
            ..PoolSettings::default()
        });
        let key = AppKey::assume_canonical("/app1");

        let mut session = pool.get(&key, &options()).await.unwrap();
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.spawn_server_pid(), Some(999));

        let spawner = pool.spawner();
        assert_eq!(spawner.spawn_count(), 1);
        let requests = spawner.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, key);
        assert_eq!(requests[0].1, options());
        drop(requests);

        let response = use_session(&mut session).await;
        assert!(response.ends_with(b"hello world"));

        drop(session);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn released_worker_is_reused_without_spawning() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");

        let session = pool.get(&key, &options()).await.unwrap();
        let first_pid = session.pid();
        drop(session);

        let session = pool.get(&key, &options()).await.unwrap();
        assert_eq!(session.pid(), first_pid);
        assert_eq!(pool.spawner().spawn_count(), 1);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_workers() {
        let pool = pool_with(PoolSettings::default());
        let s1 = pool
            .get(&AppKey::assume_canonical("/app1"), &options())
            .await
            .unwrap();
        let s2 = pool
            .get(&AppKey::assume_canonical("/app2"), &options())
            .await
            .unwrap();
        assert_ne!(s1.pid(), s2.pid());
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.count(), 2);

        drop(s1);
        drop(s2);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.count(), 2);
    }

    #[tokio::test]
    async fn different_options_do_not_share_workers() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");

        let session = pool.get(&key, &options()).await.unwrap();
        drop(session);

        let mut staging = options();
        staging.environment = "staging".to_string();
        let session = pool.get(&key, &staging).await.unwrap();
        drop(session);

        assert_eq!(pool.spawner().spawn_count(), 2);
    }

    #[tokio::test]
    async fn per_app_cap_blocks_until_release_then_reuses() {
        let pool = pool_with(PoolSettings {
            max_per_app: 1,
            ..PoolSettings::default()
        });
        let key = AppKey::assume_canonical("/app1");

        let session = pool.get(&key, &options()).await.unwrap();
        let first_pid = session.pid();

        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.get(&key, &options()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "second get must block at the cap");

        drop(session);
        let session = waiter.await.unwrap().unwrap();
        assert_eq!(session.pid(), first_pid, "the released worker is handed off");
        assert_eq!(pool.spawner().spawn_count(), 1);
    }

    #[tokio::test]
    async fn per_app_waiters_are_served_fifo() {
        let pool = pool_with(PoolSettings {
            max_per_app: 1,
            ..PoolSettings::default()
        });
        let key = AppKey::assume_canonical("/app1");
        let order = Arc::new(Mutex::new(Vec::new()));

        let session = pool.get(&key, &options()).await.unwrap();

        let mut waiters = Vec::new();
        for tag in [2u32, 3, 4] {
            let pool = pool.clone();
            let key = key.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let session = pool.get(&key, &options()).await.unwrap();
                order.lock().push(tag);
                drop(session);
            }));
            // Give each waiter time to enqueue before the next arrives.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        drop(session);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn concurrent_first_requests_coalesce_into_one_spawn() {
        let pool = pool_with(PoolSettings {
            max_per_app: 1,
            ..PoolSettings::default()
        });
        let key = AppKey::assume_canonical("/app1");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let session = pool.get(&key, &options()).await.unwrap();
                drop(session);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(pool.spawner().spawn_count(), 1);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn saturated_pool_with_no_idle_worker_is_busy() {
        let pool = pool_with(PoolSettings {
            max_pool: 1,
            ..PoolSettings::default()
        });
        let held = pool
            .get(&AppKey::assume_canonical("/a"), &options())
            .await
            .unwrap();

        let err = pool
            .get(&AppKey::assume_canonical("/b"), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Busy));
        drop(held);
    }

    #[tokio::test]
    async fn global_cap_evicts_least_recently_used_idle_worker() {
        let pool = pool_with(PoolSettings {
            max_pool: 2,
            ..PoolSettings::default()
        });
        let a = AppKey::assume_canonical("/lru/a");
        let b = AppKey::assume_canonical("/lru/b");
        let c = AppKey::assume_canonical("/lru/c");

        drop(pool.get(&a, &options()).await.unwrap());
        drop(pool.get(&b, &options()).await.unwrap());
        // Pool is full with {a, b} idle; c evicts a, the global LRU.
        drop(pool.get(&c, &options()).await.unwrap());
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.spawner().spawn_count(), 3);

        // b survived the eviction...
        drop(pool.get(&b, &options()).await.unwrap());
        assert_eq!(pool.spawner().spawn_count(), 3);

        // ...and a did not.
        drop(pool.get(&a, &options()).await.unwrap());
        assert_eq!(pool.spawner().spawn_count(), 4);
    }

    #[tokio::test]
    async fn restart_file_retires_workers_exactly_once() {
        let app_dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(app_dir.path().join("tmp")).unwrap();
        let key = AppKey::assume_canonical(app_dir.path());
        let pool = pool_with(PoolSettings::default());

        let session = pool.get(&key, &options()).await.unwrap();
        let old_pid = session.pid();
        drop(session);
        assert_eq!(pool.count(), 1);

        std::fs::write(key.restart_file(), b"").unwrap();

        let session = pool.get(&key, &options()).await.unwrap();
        assert_ne!(session.pid(), old_pid, "restart must not reuse the old worker");
        drop(session);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.spawner().spawn_count(), 2);

        // The stamp was recorded: further gets see no new restart.
        for _ in 0..3 {
            drop(pool.get(&key, &options()).await.unwrap());
        }
        assert_eq!(pool.spawner().spawn_count(), 2);

        // A newer mtime triggers exactly one more retirement.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(key.restart_file(), b"again").unwrap();
        for _ in 0..3 {
            drop(pool.get(&key, &options()).await.unwrap());
        }
        assert_eq!(pool.spawner().spawn_count(), 3);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn dead_endpoint_retires_worker_and_next_get_respawns() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");
        pool.spawner().dead_endpoints.store(true, Ordering::SeqCst);

        let err = pool.get(&key, &options()).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionIo { .. }));
        assert_eq!(pool.count(), 0, "the unreachable worker must be retired");

        pool.spawner().dead_endpoints.store(false, Ordering::SeqCst);
        let session = pool.get(&key, &options()).await.unwrap();
        assert_eq!(pool.spawner().spawn_count(), 2);
        drop(session);
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced_and_frees_capacity() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");
        pool.spawner().fail_spawns.store(true, Ordering::SeqCst);

        let err = pool.get(&key, &options()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Spawn(_)));
        assert_eq!(pool.count(), 0);

        pool.spawner().fail_spawns.store(false, Ordering::SeqCst);
        let session = pool.get(&key, &options()).await.unwrap();
        assert_eq!(pool.count(), 1);
        drop(session);
    }

    #[tokio::test]
    async fn clear_retires_idle_workers() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");
        drop(pool.get(&key, &options()).await.unwrap());
        assert_eq!(pool.count(), 1);

        pool.clear();
        assert_eq!(pool.count(), 0);

        drop(pool.get(&key, &options()).await.unwrap());
        assert_eq!(pool.spawner().spawn_count(), 2);
    }

    #[tokio::test]
    async fn session_survives_clear_and_worker_is_not_repooled() {
        let pool = pool_with(PoolSettings::default());
        let key = AppKey::assume_canonical("/app1");
        let mut session = pool.get(&key, &options()).await.unwrap();

        pool.clear();

        // The outstanding session keeps working against its worker.
        let response = use_session(&mut session).await;
        assert!(response.ends_with(b"hello world"));
        drop(session);

        // But the pre-clear worker did not return to the pool.
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn lowered_cap_retires_excess_workers_lazily() {
        let pool = pool_with(PoolSettings {
            max_pool: 2,
            ..PoolSettings::default()
        });
        let a = AppKey::assume_canonical("/a");
        let b = AppKey::assume_canonical("/b");
        drop(pool.get(&a, &options()).await.unwrap());
        drop(pool.get(&b, &options()).await.unwrap());
        assert_eq!(pool.count(), 2);

        pool.set_max(1);
        // Lowering the cap kills nothing eagerly.
        assert_eq!(pool.count(), 2);

        // The next release over the cap retires the released worker.
        let session = pool.get(&a, &options()).await.unwrap();
        drop(session);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn idle_sweeper_retires_expired_workers() {
        let pool = pool_with(PoolSettings {
            max_idle: Duration::from_secs(1),
            ..PoolSettings::default()
        });
        let key = AppKey::assume_canonical("/app1");
        drop(pool.get(&key, &options()).await.unwrap());
        assert_eq!(pool.count(), 1);

        // The sweeper ticks every second at this idle limit.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while pool.count() != 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(pool.count(), 0, "sweeper must retire the idle worker");
    }

    #[tokio::test]
    async fn caps_hold_under_concurrent_load() {
        let pool = pool_with(PoolSettings {
            max_pool: 2,
            max_per_app: 1,
            ..PoolSettings::default()
        });

        let observer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(pool.count() <= 2, "total cap violated");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let mut tasks = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            let key = AppKey::assume_canonical(format!("/load/{}", i % 3));
            tasks.push(tokio::spawn(async move {
                match pool.get(&key, &options()).await {
                    Ok(session) => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        drop(session);
                    }
                    // A saturated pool may refuse; that is the documented
                    // behavior, not a test failure.
                    Err(GatewayError::Busy) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        observer.await.unwrap();
        assert!(pool.count() <= 2);
    }
}
