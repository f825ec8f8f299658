use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::store::JobId;

/// Executes jobs handed out by the [`Scheduler`].
pub trait JobRunner: Send + Sync {
    /// Claim `job_id` and return the remainder of its work.
    ///
    /// Called with the scheduler's lock held, so dispatch order is the order
    /// in which jobs observe their start. Implementations do their synchronous
    /// bookkeeping here and must not call back into the scheduler.
    fn start(&self, job_id: JobId) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub capacity: usize,
    pub running: usize,
    pub pending: usize,
    pub accepting: bool,
}

struct SchedulerState {
    pending: VecDeque<JobId>,
    running: usize,
    closed: bool,
}

/// FIFO admission queue with a concurrency cap
///
/// # Concurrency Model
/// - `enqueue` appends to the pending queue and dispatches while slots are free
/// - Each dispatched job runs as its own task on `runtime`; dispatch never waits for it
/// - A slot is held by a guard inside the task and released exactly once when the
///   task ends, whether the job succeeded, failed, panicked or was dropped
/// - Releasing a slot re-runs dispatch, which is how queued work behind a full
///   scheduler gets started
pub struct Scheduler {
    capacity: usize,
    runner: Arc<dyn JobRunner>,
    runtime: Handle,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

impl Scheduler {
    pub fn new(capacity: usize, runner: Arc<dyn JobRunner>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            runner,
            runtime,
            state: Mutex::new(SchedulerState {
                pending: VecDeque::new(),
                running: 0,
                closed: false,
            }),
            idle: Notify::new(),
        })
    }

    pub fn enqueue(self: &Arc<Self>, job_id: JobId) {
        self.enqueue_all([job_id]);
    }

    /// Append jobs in order, then dispatch as many as capacity allows.
    pub fn enqueue_all(self: &Arc<Self>, job_ids: impl IntoIterator<Item = JobId>) {
        let started = {
            let mut state = self.state.lock();
            state.pending.extend(job_ids);
            debug!(
                "Scheduler queue: {} pending, {}/{} running",
                state.pending.len(),
                state.running,
                self.capacity
            );
            self.dispatch(&mut state)
        };
        self.spawn_all(started);
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            capacity: self.capacity,
            running: state.running,
            pending: state.pending.len(),
            accepting: !state.closed,
        }
    }

    /// Stop dispatching. Jobs already running are left to finish.
    ///
    /// Returns the number of queued jobs that will never start.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        if state.running == 0 {
            self.idle.notify_waiters();
        }
        state.pending.len()
    }

    /// Resolves once no job is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().running == 0 {
                return;
            }
            notified.await;
        }
    }

    fn on_worker_complete(self: &Arc<Self>, job_id: JobId) {
        let started = {
            let mut state = self.state.lock();
            match state.running.checked_sub(1) {
                Some(running) => state.running = running,
                None => error!(job_id = %job_id, "Worker slot released with no running jobs"),
            }
            debug!(
                job_id = %job_id,
                "Released worker slot ({}/{} running, {} pending)",
                state.running,
                self.capacity,
                state.pending.len()
            );

            let started = self.dispatch(&mut state);
            if state.running == 0 {
                self.idle.notify_waiters();
            }
            started
        };
        self.spawn_all(started);
    }

    /// Claim as many pending jobs as there are free slots.
    ///
    /// Tasks are spawned by the caller after the lock is released, since a
    /// runtime that is shutting down drops spawned futures immediately and
    /// their slot guards re-enter the scheduler.
    fn dispatch(
        self: &Arc<Self>,
        state: &mut SchedulerState,
    ) -> Vec<(WorkerSlot, BoxFuture<'static, ()>)> {
        let mut started = Vec::new();
        while !state.closed && state.running < self.capacity {
            let Some(job_id) = state.pending.pop_front() else {
                break;
            };
            state.running += 1;
            info!(
                job_id = %job_id,
                "Dispatching job ({}/{} running)",
                state.running,
                self.capacity
            );

            let slot = WorkerSlot {
                scheduler: Arc::clone(self),
                job_id,
            };
            started.push((slot, self.runner.start(job_id)));
        }
        started
    }

    fn spawn_all(&self, started: Vec<(WorkerSlot, BoxFuture<'static, ()>)>) {
        for (slot, work) in started {
            self.runtime.spawn(async move {
                let _slot = slot;
                work.await;
            });
        }
    }
}

/// Returns its slot to the scheduler when dropped.
struct WorkerSlot {
    scheduler: Arc<Scheduler>,
    job_id: JobId,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.scheduler.on_worker_complete(self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use uuid::Uuid;

    use super::*;

    /// Runner whose jobs stay busy until their gate is released.
    #[derive(Default)]
    struct GatedRunner {
        started: Mutex<Vec<JobId>>,
        gates: Mutex<HashMap<JobId, oneshot::Receiver<()>>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        panics: Mutex<Vec<JobId>>,
    }

    impl GatedRunner {
        fn gate(&self, job_id: JobId) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(job_id, rx);
            tx
        }

        fn started(&self) -> Vec<JobId> {
            self.started.lock().clone()
        }
    }

    impl JobRunner for GatedRunner {
        fn start(&self, job_id: JobId) -> BoxFuture<'static, ()> {
            self.started.lock().push(job_id);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let gate = self.gates.lock().remove(&job_id);
            let panics = self.panics.lock().contains(&job_id);
            let active = Arc::clone(&self.active);
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                active.fetch_sub(1, Ordering::SeqCst);
                if panics {
                    panic!("job blew up");
                }
            })
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    fn scheduler(capacity: usize) -> (Arc<Scheduler>, Arc<GatedRunner>) {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = Scheduler::new(capacity, runner.clone(), Handle::current());
        (scheduler, runner)
    }

    #[tokio::test]
    async fn running_never_exceeds_capacity() {
        let (scheduler, runner) = scheduler(2);
        let ids: Vec<JobId> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut gates: Vec<_> = ids.iter().map(|id| runner.gate(*id)).collect();

        scheduler.enqueue_all(ids.clone());

        let stats = scheduler.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.pending, 3);
        assert_eq!(runner.started(), ids[..2].to_vec());

        for (released, gate) in gates.drain(..).enumerate() {
            let _ = gate.send(());
            let expected = (released + 3).min(5);
            eventually("next dispatch", || runner.started().len() == expected).await;
            assert!(scheduler.stats().running <= 2);
        }

        scheduler.wait_idle().await;
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(runner.started(), ids);
        let stats = scheduler.stats();
        assert_eq!((stats.running, stats.pending), (0, 0));
    }

    #[tokio::test]
    async fn dispatch_is_fifo_with_single_slot() {
        let (scheduler, runner) = scheduler(1);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let gate_a = runner.gate(a);
        let gate_b = runner.gate(b);

        scheduler.enqueue(a);
        scheduler.enqueue(b);
        scheduler.enqueue(c);
        assert_eq!(runner.started(), vec![a]);

        let _ = gate_a.send(());
        eventually("b to start", || runner.started().len() == 2).await;
        assert_eq!(runner.started(), vec![a, b]);

        let _ = gate_b.send(());
        eventually("c to start", || runner.started().len() == 3).await;
        assert_eq!(runner.started(), vec![a, b, c]);

        scheduler.wait_idle().await;
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn every_completion_frees_its_slot() {
        let (scheduler, runner) = scheduler(1);
        let ids: Vec<JobId> = (0..10).map(|_| Uuid::new_v4()).collect();

        scheduler.enqueue_all(ids.clone());
        eventually("all jobs to run", || runner.started().len() == 10).await;
        scheduler.wait_idle().await;

        assert_eq!(runner.started(), ids);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats();
        assert_eq!((stats.running, stats.pending), (0, 0));
    }

    #[tokio::test]
    async fn panicking_job_still_releases_slot() {
        let (scheduler, runner) = scheduler(1);
        let (bad, good) = (Uuid::new_v4(), Uuid::new_v4());
        runner.panics.lock().push(bad);

        scheduler.enqueue_all([bad, good]);
        eventually("job after the panic to run", || runner.started().len() == 2).await;
        scheduler.wait_idle().await;

        assert_eq!(runner.started(), vec![bad, good]);
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn close_stops_dispatch_but_lets_running_finish() {
        let (scheduler, runner) = scheduler(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let gate_a = runner.gate(a);

        scheduler.enqueue_all([a, b]);
        assert_eq!(scheduler.close(), 1);
        assert!(!scheduler.stats().accepting);

        let _ = gate_a.send(());
        scheduler.wait_idle().await;

        assert_eq!(runner.started(), vec![a]);
        let stats = scheduler.stats();
        assert_eq!((stats.running, stats.pending), (0, 1));
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_nothing_runs() {
        let (scheduler, _runner) = scheduler(3);
        tokio::time::timeout(Duration::from_secs(1), scheduler.wait_idle())
            .await
            .expect("idle scheduler");
    }
}
