//! Periodic workers running at fixed rates.
//!
//! Each worker is a named thread that waits for its next deadline, runs one
//! [`PeriodicTask::tick`], and advances the deadline by its period. Workers
//! only suspend or stop at that wait, never in the middle of a tick.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::{BitesError, Result};

/// The five periodic workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Sensing,
    Audio,
    Inference,
    Network,
    Housekeeping,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Sensing,
        WorkerRole::Audio,
        WorkerRole::Inference,
        WorkerRole::Network,
        WorkerRole::Housekeeping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkerRole::Sensing => "sensing",
            WorkerRole::Audio => "audio",
            WorkerRole::Inference => "inference",
            WorkerRole::Network => "network",
            WorkerRole::Housekeeping => "housekeeping",
        }
    }

    pub fn default_period(self) -> Duration {
        match self {
            WorkerRole::Sensing => Duration::from_millis(1),
            WorkerRole::Audio => Duration::from_millis(2),
            WorkerRole::Inference => Duration::from_millis(10),
            WorkerRole::Network => Duration::from_millis(100),
            WorkerRole::Housekeeping => Duration::from_millis(1000),
        }
    }

    pub fn default_priority(self) -> Priority {
        match self {
            WorkerRole::Sensing | WorkerRole::Audio => Priority::Highest,
            WorkerRole::Inference => Priority::Medium,
            WorkerRole::Network | WorkerRole::Housekeeping => Priority::Low,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Priority tier of a worker. Recorded and reported; threads are spawned
/// with the platform's default scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    Highest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Runnable,
    Suspended,
    Deleted,
}

/// Rate and priority of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub role: WorkerRole,
    pub period: Duration,
    pub priority: Priority,
}

impl WorkerSpec {
    pub fn new(role: WorkerRole) -> Self {
        Self {
            role,
            period: role.default_period(),
            priority: role.default_priority(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Body of a periodic worker.
pub trait PeriodicTask: Send {
    fn tick(&mut self);
}

impl<F> PeriodicTask for F
where
    F: FnMut() + Send,
{
    fn tick(&mut self) {
        self()
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    ticks: AtomicU64,
    overruns: AtomicU64,
}

/// Tick and overrun counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub overruns: u64,
}

/// Counters published by running workers, readable from any thread.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    counters: [WorkerCounters; 5],
}

impl SchedulerStats {
    pub fn worker(&self, role: WorkerRole) -> WorkerStats {
        let counters = &self.counters[role.index()];
        WorkerStats {
            ticks: counters.ticks.load(Ordering::Relaxed),
            overruns: counters.overruns.load(Ordering::Relaxed),
        }
    }

    pub fn all(&self) -> Vec<(WorkerRole, WorkerStats)> {
        WorkerRole::ALL
            .iter()
            .map(|&role| (role, self.worker(role)))
            .collect()
    }

    fn record_tick(&self, role: WorkerRole) {
        self.counters[role.index()]
            .ticks
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_overrun(&self, role: WorkerRole) -> u64 {
        self.counters[role.index()]
            .overruns
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }
}

#[derive(Debug)]
struct Control {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

impl Control {
    fn set(&self, next: WorkerState) -> WorkerState {
        let mut state = self.state.lock();
        let previous = *state;
        *state = next;
        self.wake.notify_all();
        previous
    }
}

struct Worker {
    spec: WorkerSpec,
    control: Arc<Control>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the worker threads and their lifecycle.
pub struct Scheduler {
    workers: Vec<Worker>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            workers: Vec::with_capacity(WorkerRole::ALL.len()),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Shared counters, valid before and after the workers are created.
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Spawns a worker per entry and makes each one runnable.
    ///
    /// Roles that already have a live worker are skipped. A worker that
    /// fails to spawn is logged and the remaining ones are still created;
    /// the first failure is returned.
    ///
    /// Priorities are advisory: they are recorded and reported, but the
    /// threads run under the platform's default scheduling policy.
    pub fn create_all(
        &mut self,
        tasks: impl IntoIterator<Item = (WorkerSpec, Box<dyn PeriodicTask>)>,
    ) -> Result<()> {
        let mut first_error = None;
        for (spec, task) in tasks {
            if self.worker(spec.role).is_some() {
                debug!(worker = %spec.role, "worker already created");
                continue;
            }
            match self.spawn(spec, task) {
                Ok(worker) => {
                    worker.control.set(WorkerState::Runnable);
                    self.workers.push(worker);
                }
                Err(err) => {
                    error!(worker = %spec.role, error = %err, "failed to create worker");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pauses every runnable worker at its next periodic wait.
    pub fn suspend_all(&self) {
        for worker in &self.workers {
            let mut state = worker.control.state.lock();
            if *state == WorkerState::Runnable {
                *state = WorkerState::Suspended;
            }
        }
        info!(workers = self.workers.len(), "workers suspended");
    }

    pub fn resume_all(&self) {
        for worker in &self.workers {
            let mut state = worker.control.state.lock();
            if *state == WorkerState::Suspended {
                *state = WorkerState::Runnable;
                worker.control.wake.notify_all();
            }
        }
        info!(workers = self.workers.len(), "workers resumed");
    }

    /// Stops every worker and waits for its thread to exit.
    pub fn delete_all(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &self.workers {
            worker.control.set(WorkerState::Deleted);
        }
        for mut worker in self.workers.drain(..) {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    error!(worker = %worker.spec.role, "worker panicked");
                }
            }
        }
        info!("workers deleted");
    }

    pub fn state(&self, role: WorkerRole) -> Option<WorkerState> {
        self.worker(role).map(|worker| *worker.control.state.lock())
    }

    pub fn spec(&self, role: WorkerRole) -> Option<WorkerSpec> {
        self.worker(role).map(|worker| worker.spec)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn worker(&self, role: WorkerRole) -> Option<&Worker> {
        self.workers.iter().find(|worker| worker.spec.role == role)
    }

    fn spawn(&self, spec: WorkerSpec, mut task: Box<dyn PeriodicTask>) -> Result<Worker> {
        if spec.period.is_zero() {
            return Err(BitesError::Config(format!(
                "worker `{}` has a zero period",
                spec.role
            )));
        }

        let control = Arc::new(Control {
            state: Mutex::new(WorkerState::Created),
            wake: Condvar::new(),
        });
        let thread_control = Arc::clone(&control);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(format!("bites-{}", spec.role))
            .spawn(move || run_worker(spec, task.as_mut(), &thread_control, &stats))
            .map_err(|source| BitesError::WorkerSpawn {
                worker: spec.role.name(),
                source,
            })?;

        info!(
            worker = %spec.role,
            period_us = spec.period.as_micros() as u64,
            priority = ?spec.priority,
            "worker created"
        );
        Ok(Worker {
            spec,
            control,
            thread: Some(handle),
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.delete_all();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "workers",
                &self.workers.iter().map(|w| w.spec.role).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn run_worker(
    spec: WorkerSpec,
    task: &mut dyn PeriodicTask,
    control: &Control,
    stats: &SchedulerStats,
) {
    let mut deadline = Instant::now() + spec.period;
    loop {
        {
            let mut state = control.state.lock();
            let mut paused = false;
            loop {
                match *state {
                    WorkerState::Deleted => return,
                    WorkerState::Created | WorkerState::Suspended => {
                        paused = true;
                        control.wake.wait(&mut state);
                    }
                    WorkerState::Runnable => {
                        if paused {
                            deadline = Instant::now() + spec.period;
                            paused = false;
                        }
                        if Instant::now() >= deadline {
                            break;
                        }
                        control.wake.wait_until(&mut state, deadline);
                    }
                }
            }
        }

        task.tick();
        stats.record_tick(spec.role);

        deadline += spec.period;
        let now = Instant::now();
        if now > deadline {
            let overruns = stats.record_overrun(spec.role);
            trace!(worker = %spec.role, overruns, "tick overran its period");
            deadline = now + spec.period;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Box<dyn PeriodicTask> {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn fast(role: WorkerRole) -> WorkerSpec {
        WorkerSpec::new(role).with_period(Duration::from_millis(1))
    }

    #[test]
    fn default_rates_and_priorities() {
        assert_eq!(WorkerRole::Sensing.default_period(), Duration::from_millis(1));
        assert_eq!(WorkerRole::Audio.default_period(), Duration::from_millis(2));
        assert_eq!(WorkerRole::Inference.default_priority(), Priority::Medium);
        assert_eq!(WorkerRole::Housekeeping.default_period(), Duration::from_secs(1));
        assert!(WorkerRole::Sensing.default_priority() > WorkerRole::Network.default_priority());
    }

    #[test]
    fn workers_tick_until_deleted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .create_all([(fast(WorkerRole::Sensing), counting_task(&counter))])
            .unwrap();
        assert_eq!(scheduler.state(WorkerRole::Sensing), Some(WorkerState::Runnable));

        thread::sleep(Duration::from_millis(50));
        assert!(counter.load(Ordering::SeqCst) > 5);
        assert!(scheduler.stats().worker(WorkerRole::Sensing).ticks > 5);

        scheduler.delete_all();
        assert!(scheduler.is_empty());
        let after = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[test]
    fn suspend_and_resume_gate_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .create_all([(fast(WorkerRole::Audio), counting_task(&counter))])
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        scheduler.suspend_all();
        assert_eq!(scheduler.state(WorkerRole::Audio), Some(WorkerState::Suspended));
        thread::sleep(Duration::from_millis(10));
        let paused = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), paused);

        scheduler.resume_all();
        thread::sleep(Duration::from_millis(30));
        assert!(counter.load(Ordering::SeqCst) > paused);
    }

    #[test]
    fn create_all_skips_roles_already_running() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();

        scheduler
            .create_all([(fast(WorkerRole::Network), counting_task(&first))])
            .unwrap();
        scheduler
            .create_all([
                (fast(WorkerRole::Network), counting_task(&second)),
                (fast(WorkerRole::Inference), counting_task(&second)),
            ])
            .unwrap();

        assert_eq!(scheduler.len(), 2);
        thread::sleep(Duration::from_millis(20));
        assert!(first.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn invalid_worker_does_not_block_the_others() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();

        let result = scheduler.create_all([
            (
                WorkerSpec::new(WorkerRole::Network).with_period(Duration::ZERO),
                counting_task(&counter),
            ),
            (fast(WorkerRole::Housekeeping), counting_task(&counter)),
        ]);

        assert!(matches!(result, Err(BitesError::Config(_))));
        assert_eq!(scheduler.state(WorkerRole::Network), None);
        assert_eq!(
            scheduler.state(WorkerRole::Housekeeping),
            Some(WorkerState::Runnable)
        );
    }

    #[test]
    fn slow_ticks_count_overruns() {
        let mut scheduler = Scheduler::new();
        let slow: Box<dyn PeriodicTask> = Box::new(|| thread::sleep(Duration::from_millis(4)));
        scheduler
            .create_all([(fast(WorkerRole::Inference), slow)])
            .unwrap();

        thread::sleep(Duration::from_millis(40));
        scheduler.delete_all();

        let stats = scheduler.stats().worker(WorkerRole::Inference);
        assert!(stats.ticks > 0);
        assert!(stats.overruns > 0);
    }

    #[test]
    fn overrun_waits_a_full_period_before_the_next_tick() {
        let period = Duration::from_millis(10);
        let ticks: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
        let recorded = Arc::clone(&ticks);
        let task: Box<dyn PeriodicTask> = Box::new(move || {
            let start = Instant::now();
            if recorded.lock().is_empty() {
                thread::sleep(Duration::from_millis(25));
            }
            recorded.lock().push((start, Instant::now()));
        });

        let mut scheduler = Scheduler::new();
        scheduler
            .create_all([(WorkerSpec::new(WorkerRole::Network).with_period(period), task)])
            .unwrap();
        thread::sleep(Duration::from_millis(80));
        scheduler.delete_all();

        let ticks = ticks.lock();
        assert!(ticks.len() >= 2);
        let (_, first_end) = ticks[0];
        let (second_start, _) = ticks[1];
        assert!(second_start.duration_since(first_end) >= period - Duration::from_millis(1));
        assert!(scheduler.stats().worker(WorkerRole::Network).overruns >= 1);
    }

    #[test]
    fn drop_joins_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut scheduler = Scheduler::new();
            scheduler
                .create_all([(fast(WorkerRole::Sensing), counting_task(&counter))])
                .unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        let after = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }
}
