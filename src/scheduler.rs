//! Run scheduler
//!
//! Two published collections drive execution:
//!
//! - the **queue**, a sequence of [`QueuedRun`] records identified by `rid`,
//!   executed in order;
//! - the **timed** table, a mapping from `trid` to [`TimedRun`] records,
//!   each due at a wall-clock time.
//!
//! A single loop task executes one run at a time. Before every queue run it
//! checks the timed table: a due entry is removed, given the next `rid`, and
//! inserted at the head of the queue, so it runs before anything already
//! waiting. The head of the queue stays in place while it executes and is
//! removed once the run ends, whether it succeeded or failed.
//!
//! Submissions and cancellations go through a cloneable [`SchedulerHandle`]
//! and may happen at any time, including while a run is executing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MasterError, MasterResult};
use crate::messages::RunParams;
use crate::protocol::Value;
use crate::sync_struct::{lock, Notifier, SharedNotifier};

/// Executes runs for the scheduler.
#[async_trait]
pub trait RunExecutor: Send + 'static {
    /// Runs one experiment to completion, aborting after `timeout`.
    ///
    /// Run failures are returned here and only logged by the scheduler.
    async fn run(&mut self, params: &RunParams, timeout: Option<Duration>) -> MasterResult<()>;

    /// Releases resources once the scheduler has stopped.
    async fn shutdown(&mut self);
}

/// Called with `(rid, run_params)` just before a run starts.
pub type RunCallback = Arc<dyn Fn(u64, &RunParams) + Send + Sync>;

/// Queue entry, as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRun {
    /// Run id, unique for the lifetime of the scheduler
    pub rid: u64,
    /// What to run
    pub run_params: RunParams,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Timed table entry, as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedRun {
    /// Seconds since the Unix epoch
    pub next_run: f64,
    /// What to run
    pub run_params: RunParams,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Current time in seconds since the Unix epoch.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn timeout_duration(timeout: Option<f64>) -> MasterResult<Option<Duration>> {
    timeout
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| MasterError::Protocol(format!("invalid timeout {secs}")))
        })
        .transpose()
}

/// Longest single sleep of the loop while a timed run is pending. Any
/// submission or cancellation wakes it earlier.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Time left until `next_run`, capped at [`MAX_WAIT`]. Never zero for a run
/// in the future, however far away.
fn delay_until(next_run: f64, now: f64) -> Duration {
    Duration::try_from_secs_f64(next_run - now).map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}

struct State {
    next_rid: u64,
    running: Option<u64>,
}

enum Step {
    Run(QueuedRun),
    Wait(Option<Duration>),
}

// Lock order: state, then timed, then queue.
struct Shared {
    state: Mutex<State>,
    queue: SharedNotifier,
    timed: SharedNotifier,
    queue_changed: Notify,
    timed_changed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, now: f64) -> MasterResult<Step> {
        let mut state = self.state();
        let mut timed = lock(&self.timed);

        let mut earliest: Option<(Value, TimedRun)> = None;
        for (trid, record) in timed.read().as_dict().unwrap_or_default() {
            let run: TimedRun = record.deserialize_into()?;
            if earliest
                .as_ref()
                .map_or(true, |(_, best)| run.next_run < best.next_run)
            {
                earliest = Some((trid.clone(), run));
            }
        }

        let mut wait = None;
        if let Some((trid, run)) = earliest {
            if run.next_run <= now {
                timed.remove_key(trid.clone())?;
                let rid = state.next_rid;
                state.next_rid += 1;
                let queued = QueuedRun {
                    rid,
                    run_params: run.run_params,
                    timeout: run.timeout,
                };
                lock(&self.queue).insert(0, Value::from_serialize(&queued)?)?;
                info!("Timed run TRID {} is due, queued as RID {}", trid, rid);
                state.running = Some(rid);
                return Ok(Step::Run(queued));
            }
            wait = Some(delay_until(run.next_run, now));
        }

        let head = lock(&self.queue)
            .read()
            .as_list()
            .and_then(|items| items.first())
            .map(Value::deserialize_into::<QueuedRun>)
            .transpose()?;
        if let Some(head) = head {
            state.running = Some(head.rid);
            return Ok(Step::Run(head));
        }
        Ok(Step::Wait(wait))
    }

    /// Clears the running mark and, for a run that ended, removes its entry.
    fn finish(&self, rid: u64, ended: bool) {
        let mut state = self.state();
        state.running = None;
        if !ended {
            return;
        }
        let mut queue = lock(&self.queue);
        if let Some(index) = position_of(queue.read(), rid) {
            if let Err(e) = queue.remove_at(index as i64) {
                error!("Failed to remove RID {} from the queue: {}", rid, e);
            }
        }
    }
}

fn position_of(queue: &Value, rid: u64) -> Option<usize> {
    queue.as_list()?.iter().position(|entry| {
        entry.get("rid").and_then(Value::as_i64) == i64::try_from(rid).ok()
    })
}

/// Submission and cancellation interface, usable from any task.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Appends a run to the queue and returns its `rid`.
    pub fn submit_queued(&self, run_params: RunParams, timeout: Option<f64>) -> MasterResult<u64> {
        timeout_duration(timeout)?;
        let rid = {
            let mut state = self.shared.state();
            let rid = state.next_rid;
            let record = Value::from_serialize(&QueuedRun {
                rid,
                run_params,
                timeout,
            })?;
            lock(&self.shared.queue).append(record)?;
            state.next_rid += 1;
            rid
        };
        debug!("Queued RID {}", rid);
        self.shared.queue_changed.notify_one();
        Ok(rid)
    }

    /// Removes a queued run. The run currently executing cannot be removed.
    pub fn cancel_queued(&self, rid: u64) -> MasterResult<()> {
        let state = self.shared.state();
        if state.running == Some(rid) {
            return Err(MasterError::Cancellation(rid));
        }
        let mut queue = lock(&self.shared.queue);
        let index = position_of(queue.read(), rid)
            .ok_or_else(|| MasterError::Lookup(format!("RID {rid} is not queued")))?;
        queue.remove_at(index as i64)?;
        debug!("Cancelled RID {}", rid);
        Ok(())
    }

    /// Adds a timed run due at `next_run` (now when `None`) and returns its
    /// `trid`, the smallest non-negative integer not in use.
    pub fn submit_timed(
        &self,
        run_params: RunParams,
        timeout: Option<f64>,
        next_run: Option<f64>,
    ) -> MasterResult<u64> {
        timeout_duration(timeout)?;
        let next_run = next_run.unwrap_or_else(now);
        if !next_run.is_finite() {
            return Err(MasterError::Protocol(format!("invalid run time {next_run}")));
        }
        let trid = {
            let mut timed = lock(&self.shared.timed);
            let trid = (0u64..)
                .find(|t| timed.read().get_key(&Value::from(*t)).is_none())
                .unwrap_or_default();
            let record = Value::from_serialize(&TimedRun {
                next_run,
                run_params,
                timeout,
            })?;
            timed.insert(trid, record)?;
            trid
        };
        debug!("Added timed run TRID {} at {}", trid, next_run);
        self.shared.timed_changed.notify_one();
        Ok(trid)
    }

    /// Removes a timed run.
    pub fn cancel_timed(&self, trid: u64) -> MasterResult<()> {
        let mut timed = lock(&self.shared.timed);
        if timed.read().get_key(&Value::from(trid)).is_none() {
            return Err(MasterError::Lookup(format!("TRID {trid} not found")));
        }
        timed.remove_key(trid)?;
        debug!("Cancelled TRID {}", trid);
        Ok(())
    }

    /// The run queue: a sequence of [`QueuedRun`] in execution order. The
    /// head is the run currently executing, if any.
    pub fn queue(&self) -> SharedNotifier {
        self.shared.queue.clone()
    }

    /// Timed runs keyed by `trid`, each a [`TimedRun`].
    pub fn timed(&self) -> SharedNotifier {
        self.shared.timed.clone()
    }

    /// `rid` of the run currently executing.
    pub fn running(&self) -> Option<u64> {
        self.shared.state().running
    }

    /// Typed snapshot of the queue.
    pub fn queued_runs(&self) -> MasterResult<Vec<QueuedRun>> {
        lock(&self.shared.queue)
            .read()
            .as_list()
            .unwrap_or_default()
            .iter()
            .map(Value::deserialize_into::<QueuedRun>)
            .collect()
    }
}

/// Owns the loop task and the executor.
pub struct Scheduler<E: RunExecutor> {
    handle: SchedulerHandle,
    run_cb: RunCallback,
    executor: Option<E>,
    cancel: CancellationToken,
    task: Option<JoinHandle<E>>,
}

impl<E: RunExecutor> Scheduler<E> {
    /// Scheduler around `executor`. Nothing runs until [`Scheduler::start`].
    pub fn new(executor: E, run_cb: RunCallback) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_rid: 0,
                running: None,
            }),
            queue: Notifier::shared(Value::list()),
            timed: Notifier::shared(Value::dict()),
            queue_changed: Notify::new(),
            timed_changed: Notify::new(),
        });
        Self {
            handle: SchedulerHandle { shared },
            run_cb,
            executor: Some(executor),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// A new handle sharing this scheduler's state.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Spawns the loop task. Has no effect once started.
    pub fn start(&mut self) {
        let Some(executor) = self.executor.take() else {
            warn!("Scheduler already started");
            return;
        };
        self.task = Some(tokio::spawn(schedule(
            self.handle.shared.clone(),
            executor,
            self.run_cb.clone(),
            self.cancel.clone(),
        )));
    }

    /// Cancels the loop (aborting a run in progress), waits for it to end,
    /// then shuts the executor down.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let executor = match self.task.take() {
            Some(task) => match task.await {
                Ok(executor) => Some(executor),
                Err(e) => {
                    error!("Scheduler task panicked: {}", e);
                    None
                }
            },
            None => self.executor.take(),
        };
        if let Some(mut executor) = executor {
            executor.shutdown().await;
        }
    }
}

async fn schedule<E: RunExecutor>(
    shared: Arc<Shared>,
    mut executor: E,
    run_cb: RunCallback,
    cancel: CancellationToken,
) -> E {
    info!("Scheduler started");
    loop {
        let wait = match shared.next_step(now()) {
            Ok(Step::Run(run)) => {
                let ended = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = execute(&mut executor, &run, &run_cb) => true,
                };
                shared.finish(run.rid, ended);
                if !ended {
                    info!("RID {} aborted by shutdown", run.rid);
                    break;
                }
                continue;
            }
            Ok(Step::Wait(wait)) => wait,
            Err(e) => {
                error!("Scheduler state is inconsistent: {}", e);
                None
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.queue_changed.notified() => {}
            _ = shared.timed_changed.notified() => {}
            _ = sleep_for(wait) => {}
        }
    }
    info!("Scheduler stopped");
    executor
}

async fn execute<E: RunExecutor>(executor: &mut E, run: &QueuedRun, run_cb: &RunCallback) {
    run_cb(run.rid, &run.run_params);
    info!("RID {} started: {}", run.rid, run.run_params.experiment);
    let timeout = timeout_duration(run.timeout).ok().flatten();
    match executor.run(&run.run_params, timeout).await {
        Ok(()) => info!("RID {} completed", run.rid),
        Err(e) => error!("RID {} failed: {}", run.rid, e),
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Reports the experiment name of every run and blocks on "block" until
    /// released.
    struct FakeExecutor {
        events: mpsc::UnboundedSender<String>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl RunExecutor for FakeExecutor {
        async fn run(&mut self, params: &RunParams, _timeout: Option<Duration>) -> MasterResult<()> {
            let _ = self.events.send(params.experiment.clone());
            match params.experiment.as_str() {
                "block" => {
                    self.release.notified().await;
                    Ok(())
                }
                "fail" => Err(MasterError::UnitExecution("failed".to_string())),
                _ => Ok(()),
            }
        }

        async fn shutdown(&mut self) {
            let _ = self.events.send("shutdown".to_string());
        }
    }

    struct Fixture {
        scheduler: Scheduler<FakeExecutor>,
        events: mpsc::UnboundedReceiver<String>,
        release: Arc<Notify>,
        started: Arc<Mutex<Vec<u64>>>,
    }

    fn fixture() -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let started = Arc::new(Mutex::new(Vec::new()));
        let recorder = started.clone();
        let scheduler = Scheduler::new(
            FakeExecutor {
                events: tx,
                release: release.clone(),
            },
            Arc::new(move |rid: u64, _: &RunParams| {
                recorder.lock().unwrap().push(rid)
            }),
        );
        Fixture {
            scheduler,
            events,
            release,
            started,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_rids_increase() {
        let f = fixture();
        let handle = f.scheduler.handle();
        for expected in 0..3 {
            let rid = handle.submit_queued(RunParams::new("noop"), None).unwrap();
            assert_eq!(rid, expected);
        }
        let rids: Vec<u64> = handle
            .queued_runs()
            .unwrap()
            .iter()
            .map(|r| r.rid)
            .collect();
        assert_eq!(rids, vec![0, 1, 2]);
        assert!(handle.submit_queued(RunParams::new("noop"), Some(-1.0)).is_err());
    }

    #[test]
    fn test_trid_reuses_smallest_free() {
        let f = fixture();
        let handle = f.scheduler.handle();
        let later = Some(now() + 3600.0);
        for expected in 0..3 {
            let trid = handle
                .submit_timed(RunParams::new("noop"), None, later)
                .unwrap();
            assert_eq!(trid, expected);
        }
        handle.cancel_timed(1).unwrap();
        assert_eq!(
            handle
                .submit_timed(RunParams::new("noop"), None, later)
                .unwrap(),
            1
        );
        assert_eq!(
            handle
                .submit_timed(RunParams::new("noop"), None, later)
                .unwrap(),
            3
        );
        assert!(matches!(handle.cancel_timed(7), Err(MasterError::Lookup(_))));
    }

    #[tokio::test]
    async fn test_due_timed_run_preempts_queue() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        handle.submit_queued(RunParams::new("queued"), None).unwrap();
        handle.submit_timed(RunParams::new("timed"), None, None).unwrap();

        f.scheduler.start();
        assert_eq!(next_event(&mut f.events).await, "timed");
        assert_eq!(next_event(&mut f.events).await, "queued");
        wait_until(|| handle.queued_runs().unwrap().is_empty()).await;

        assert_eq!(*f.started.lock().unwrap(), vec![1, 0]);
        assert!(lock(&handle.timed()).read().as_dict().unwrap().is_empty());
        f.scheduler.stop().await;
        assert_eq!(next_event(&mut f.events).await, "shutdown");
    }

    #[tokio::test]
    async fn test_future_timed_run_waits() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        f.scheduler.start();
        handle
            .submit_timed(RunParams::new("soon"), None, Some(now() + 0.2))
            .unwrap();
        handle.submit_queued(RunParams::new("first"), None).unwrap();

        assert_eq!(next_event(&mut f.events).await, "first");
        assert_eq!(next_event(&mut f.events).await, "soon");
        f.scheduler.stop().await;
    }

    #[test]
    fn test_far_future_delay_is_capped() {
        let t = 1000.0;
        assert_eq!(delay_until(t + 0.5, t), Duration::from_millis(500));
        assert_eq!(delay_until(t + 7200.0, t), MAX_WAIT);
        // Too far away for a Duration: still a long sleep, never a busy loop.
        assert_eq!(delay_until(1e20, t), MAX_WAIT);
        assert_eq!(delay_until(f64::MAX, t), MAX_WAIT);
    }

    #[tokio::test]
    async fn test_far_future_timed_run_leaves_loop_idle() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        handle
            .submit_timed(RunParams::new("never"), None, Some(1e20))
            .unwrap();
        assert!(matches!(
            handle.shared.next_step(now()),
            Ok(Step::Wait(Some(wait))) if wait == MAX_WAIT
        ));

        f.scheduler.start();
        handle.submit_queued(RunParams::new("queued"), None).unwrap();
        assert_eq!(next_event(&mut f.events).await, "queued");
        wait_until(|| handle.queued_runs().unwrap().is_empty()).await;
        assert_eq!(lock(&handle.timed()).read().as_dict().map(<[_]>::len), Some(1));
        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_rules() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        f.scheduler.start();

        let running = handle.submit_queued(RunParams::new("block"), None).unwrap();
        assert_eq!(next_event(&mut f.events).await, "block");
        assert_eq!(handle.running(), Some(running));
        assert!(matches!(
            handle.cancel_queued(running),
            Err(MasterError::Cancellation(rid)) if rid == running
        ));

        let skipped = handle.submit_queued(RunParams::new("skipped"), None).unwrap();
        handle.submit_queued(RunParams::new("after"), None).unwrap();
        handle.cancel_queued(skipped).unwrap();
        assert!(matches!(
            handle.cancel_queued(skipped),
            Err(MasterError::Lookup(_))
        ));

        f.release.notify_one();
        assert_eq!(next_event(&mut f.events).await, "after");
        wait_until(|| handle.queued_runs().unwrap().is_empty()).await;
        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_loop() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        handle.submit_queued(RunParams::new("fail"), None).unwrap();
        handle.submit_queued(RunParams::new("ok"), None).unwrap();
        f.scheduler.start();

        assert_eq!(next_event(&mut f.events).await, "fail");
        assert_eq!(next_event(&mut f.events).await, "ok");
        wait_until(|| handle.queued_runs().unwrap().is_empty()).await;
        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_aborts_running_run() {
        let mut f = fixture();
        let handle = f.scheduler.handle();
        f.scheduler.start();
        handle.submit_queued(RunParams::new("block"), None).unwrap();
        assert_eq!(next_event(&mut f.events).await, "block");

        timeout(WAIT, f.scheduler.stop()).await.unwrap();
        assert_eq!(next_event(&mut f.events).await, "shutdown");
        assert_eq!(handle.running(), None);
        assert_eq!(handle.queued_runs().unwrap().len(), 1);
    }
}
