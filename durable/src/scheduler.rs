use crate::{
    RunSpaceId,
    runspace::{ExecutionHost, RunSpace},
};
use ahash::AHashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

/// Runs one slice of a run space.
pub type SliceHandler = Arc<dyn Fn(&Arc<RunSpace>) + Send + Sync>;

struct WorkItem {
    space: Arc<RunSpace>,
}

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<WorkItem>>,
    has_work: Condvar,
    should_stop: AtomicBool,
    dedicated_for: Mutex<Option<RunSpaceId>>, // Some(id) == dedicated; None == pool
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
            dedicated_for: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, w: WorkItem) {
        {
            let mut q = self.local.lock();
            q.push_front(w);
        }
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        self.local.lock().pop_front()
    }

    fn steal_back(&self) -> Option<WorkItem> {
        self.local.lock().pop_back()
    }

    fn stop_and_join(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
        self.has_work.notify_one();
        if let Some(h) = self.handle.lock().take() {
            // A slice may quiesce its own host; never join ourselves.
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleConfig {
    /// If avg backlog per non-dedicated worker exceeds this, spawn a worker.
    pub spawn_backlog_threshold: usize,
    /// If a pool worker is idle for this long, it exits.
    pub retire_after_idle: Duration,
    /// Upper bound of pool workers (excluding main + dedicated).
    pub max_pool_workers: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            spawn_backlog_threshold: 4,
            retire_after_idle: Duration::from_millis(500),
            max_pool_workers: thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Placement {
    pinned: Option<WorkerId>,
    dedicated: Option<WorkerId>,
}

/// Thread pool host for run spaces: a main-thread queue driven by the
/// embedder, work-stealing pool workers and dedicated workers.
pub struct Scheduler {
    me: Weak<Scheduler>,
    main: Arc<Worker>,
    pool: Mutex<Vec<Arc<Worker>>>,
    dedicated: Mutex<AHashMap<RunSpaceId, Arc<Worker>>>,
    placements: Mutex<AHashMap<RunSpaceId, Placement>>,
    id_gen: AtomicU64,
    scale: ScaleConfig,
    handler: OnceLock<SliceHandler>,
}

impl Scheduler {
    pub fn new(scale: ScaleConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            main: Worker::new(WorkerId(0)),
            pool: Mutex::new(Vec::new()),
            dedicated: Mutex::new(AHashMap::new()),
            placements: Mutex::new(AHashMap::new()),
            id_gen: AtomicU64::new(0),
            scale,
            handler: OnceLock::new(),
        })
    }

    /// Installs what runs for each submission. Only the first call sticks.
    pub fn set_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<RunSpace>) + Send + Sync + 'static,
    {
        if self.handler.set(Arc::new(f)).is_err() {
            warn!("scheduler handler already set");
        }
    }

    /// Create a new worker thread. Falls back to the main worker when the
    /// thread cannot be started.
    fn spawn_worker(&self, dedicated_for: Option<RunSpaceId>) -> Arc<Worker> {
        let Some(me) = self.me.upgrade() else {
            return Arc::clone(&self.main);
        };
        let id = WorkerId(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1); // start from 1
        let w = Worker::new(id);
        *w.dedicated_for.lock() = dedicated_for;
        let name = match dedicated_for {
            Some(space) => format!("sched-dedicated-{}-for-{}", id.0, space.0),
            None => format!("sched-worker-{}", id.0),
        };
        let w_clone = Arc::clone(&w);
        let dedicated = dedicated_for.is_some();
        match thread::Builder::new()
            .name(name)
            .spawn(move || me.worker_loop(w_clone, dedicated))
        {
            Ok(handle) => *w.handle.lock() = Some(handle),
            Err(err) => {
                warn!("could not start worker {}: {err}", id.0);
                return Arc::clone(&self.main);
            }
        }
        match dedicated_for {
            Some(space) => {
                self.dedicated.lock().insert(space, Arc::clone(&w));
            }
            None => self.pool.lock().push(Arc::clone(&w)),
        }
        w
    }

    fn spawn_pool_worker(&self) -> Arc<Worker> {
        self.spawn_worker(None)
    }

    fn spawn_dedicated(&self, space: RunSpaceId) -> Arc<Worker> {
        self.spawn_worker(Some(space))
    }

    /// Drive the main-thread worker **once**. Returns true if something ran.
    pub fn run_main_once(&self) -> bool {
        if let Some(work) = self.main.pop() {
            self.run_space(work.space);
            true
        } else {
            // Small, opportunistic steal from pool to keep main alive.
            let pool_snapshot = self.pool.lock().clone();
            for w in pool_snapshot {
                if let Some(work) = w.steal_back() {
                    self.run_space(work.space);
                    return true;
                }
            }
            false
        }
    }

    /// Drive the main thread until nothing runs for `idle_for` duration.
    pub fn run_main_until_idle(&self, idle_for: Duration) {
        let deadline = Instant::now() + idle_for;
        loop {
            if self.run_main_once() {
                continue;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue a run space for one slice. Honors dedicated/pinned if present.
    pub fn submit(&self, space: Arc<RunSpace>) {
        if space.is_done() {
            return;
        }
        let id = space.id();
        let placement = self.placements.lock().get(&id).copied().unwrap_or_default();

        if placement.dedicated.is_some() {
            let w = match self.dedicated.lock().get(&id).cloned() {
                Some(w) => w,
                None => self.spawn_dedicated(id),
            };
            w.push(WorkItem { space });
            return;
        }

        if let Some(wid) = placement.pinned {
            if wid == WorkerId(0) {
                self.main.push(WorkItem { space });
                return;
            }
            let found = {
                let pool = self.pool.lock();
                pool.iter().find(|w| w.id == wid).cloned()
            };
            let w = match found {
                Some(w) => w,
                None => {
                    let w = self.spawn_pool_worker();
                    self.pin(id, w.id);
                    w
                }
            };
            w.push(WorkItem { space });
            return;
        }

        let w = self.pick_or_spawn_pool_worker();
        w.push(WorkItem { space });
    }

    pub fn pin(&self, space: RunSpaceId, worker: WorkerId) {
        self.placements.lock().entry(space).or_default().pinned = Some(worker);
    }

    pub fn unpin(&self, space: RunSpaceId) {
        if let Some(p) = self.placements.lock().get_mut(&space) {
            p.pinned = None;
        }
    }

    pub fn dedicate(&self, space: RunSpaceId) {
        let mut placements = self.placements.lock();
        let placement = placements.entry(space).or_default();
        if placement.dedicated.is_none() {
            let w = self.spawn_dedicated(space);
            placement.dedicated = Some(w.id);
        }
    }

    pub fn undedicate(&self, space: RunSpaceId) {
        let taken = self
            .placements
            .lock()
            .get_mut(&space)
            .and_then(|p| p.dedicated.take());
        if taken.is_some()
            && let Some(w) = self.dedicated.lock().remove(&space)
        {
            w.stop_and_join();
        }
    }

    /// Stops and joins every worker thread. Work still queued on them is
    /// dropped; the main queue is kept.
    pub fn shutdown(&self) {
        let pool: Vec<_> = self.pool.lock().drain(..).collect();
        for w in pool {
            w.stop_and_join();
        }
        let dedicated: Vec<_> = self.dedicated.lock().drain().map(|(_, w)| w).collect();
        for w in dedicated {
            w.stop_and_join();
        }
    }

    fn worker_loop(self: Arc<Self>, me: Arc<Worker>, dedicated: bool) {
        let retire_after = self.scale.retire_after_idle;
        let mut last_work = Instant::now();

        loop {
            if me.should_stop.load(Ordering::Relaxed) {
                break;
            }

            if let Some(work) = me.pop() {
                self.run_space(work.space);
                last_work = Instant::now();
                continue;
            }

            if !dedicated && let Some(work) = self.try_steal(&me) {
                self.run_space(work.space);
                last_work = Instant::now();
                continue;
            }

            let timeout = Duration::from_millis(10);
            {
                let mut guard = me.local.lock();
                if guard.is_empty() {
                    let _ = me.has_work.wait_for(&mut guard, timeout);
                }
            }

            if !dedicated && Instant::now().duration_since(last_work) >= retire_after {
                {
                    let mut pool = self.pool.lock();
                    if let Some(pos) = pool.iter().position(|w| w.id == me.id) {
                        pool.swap_remove(pos);
                    }
                }
                let leftover: Vec<_> = me.local.lock().drain(..).collect();
                for work in leftover {
                    self.submit(work.space);
                }
                trace!("worker {} retired", me.id.0);
                break;
            }
        }
    }

    fn try_steal(&self, me: &Arc<Worker>) -> Option<WorkItem> {
        let pool_snapshot = self.pool.lock().clone();
        for w in pool_snapshot {
            if w.id != me.id
                && let Some(work) = w.steal_back()
            {
                return Some(work);
            }
        }
        None
    }

    fn run_space(&self, space: Arc<RunSpace>) {
        if space.is_done() {
            return;
        }
        match self.handler.get() {
            Some(h) => h(&space),
            None => warn!("no handler for {}", space.id()),
        }
    }

    fn pick_or_spawn_pool_worker(&self) -> Arc<Worker> {
        let pool = self.pool.lock();
        if pool.is_empty() {
            if self.scale.max_pool_workers > 0 {
                drop(pool);
                return self.spawn_pool_worker();
            } else {
                return Arc::clone(&self.main);
            }
        }

        let total_backlog: usize = pool.iter().map(|w| w.local.lock().len()).sum();
        let avg = total_backlog / pool.len().max(1);

        if avg >= self.scale.spawn_backlog_threshold && pool.len() < self.scale.max_pool_workers {
            drop(pool);
            return self.spawn_pool_worker();
        }

        pool.iter()
            .min_by_key(|w| w.local.lock().len())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.main))
    }
}

impl ExecutionHost for Scheduler {
    fn submit(&self, space: Arc<RunSpace>) {
        Scheduler::submit(self, space);
    }

    fn quiesce(&self) {
        self.shutdown();
    }
}
