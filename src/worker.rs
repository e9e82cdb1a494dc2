//! Session worker with a serialized command queue
//!
//! Sensor interface drivers are not safe for concurrent or reentrant calls, so
//! every interaction with a device is funnelled through one dedicated thread.
//! This worker:
//!
//! - Owns the session state `S` on its own thread (the state never has to be `Send`)
//! - Executes submitted units strictly FIFO, one at a time
//! - Returns results to blocking callers over a plain channel, so waiting
//!   works from any thread, async runtime threads included
//! - Runs repeating units at a fixed rate without ever overlapping them
//! - Survives faults: an error or panic inside a unit is handed back to the
//!   submitter instead of tearing the thread down
//!
//! The queue is consumed by a current-thread tokio runtime living on the
//! worker thread, which provides the timer wheel for repeating units.
//!
//! # Example
//!
//! ```
//! use sensor_bridge::worker::SessionWorker;
//! use std::time::Duration;
//!
//! let worker = SessionWorker::spawn("counter", || 0u32)?;
//! worker.execute(|count| *count += 1)?;
//! let seen = worker.submit_and_wait(|count| Ok(*count))?;
//! assert_eq!(seen, 1);
//! worker.shutdown(Duration::from_secs(1));
//! # Ok::<(), sensor_bridge::worker::WorkerError>(())
//! ```

use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};

/// Errors raised by the worker itself, or carried back from a failed unit.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker no longer accepts work.
    #[error("Session worker has been shut down")]
    ShutDown,

    /// The worker went away before the unit produced a result.
    #[error("Unit of work was abandoned before it completed")]
    Abandoned,

    /// A blocking wait was attempted from the worker thread itself.
    #[error("Blocking submission from the worker thread would deadlock")]
    Reentrant,

    /// The unit returned an error or panicked.
    #[error("Unit of work failed: {0}")]
    Failed(#[source] anyhow::Error),

    /// The worker thread or its runtime could not be created.
    #[error("Failed to start session worker: {0}")]
    Spawn(#[from] std::io::Error),
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;
type RepeatingJob<S> = Box<dyn FnMut(&mut S) -> ControlFlow<()> + Send>;

enum Command<S> {
    Run(Job<S>),
    Repeat(Periodic<S>),
    Shutdown,
}

struct Periodic<S> {
    work: RepeatingJob<S>,
    next_run: Instant,
    period: Duration,
    cancel: CancelHandle,
}

/// Cancels a repeating unit.
///
/// Cancelling never interrupts a tick that is already executing; it only
/// prevents the ticks after it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a handle that is not yet attached to any repeating unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent all future executions.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the unit has been cancelled, either by a caller or by the
    /// unit itself returning `ControlFlow::Break`.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Pending result of a submitted unit.
#[must_use = "dropping a JobHandle discards the unit's result"]
pub struct JobHandle<T> {
    rx: std_mpsc::Receiver<Result<T, WorkerError>>,
    worker_thread: ThreadId,
}

impl<T> JobHandle<T> {
    /// Block the calling thread until the unit completes.
    ///
    /// Works from any thread other than the worker's, including threads
    /// driving an async runtime; the wait itself parks only the caller.
    pub fn wait(self) -> Result<T, WorkerError> {
        if thread::current().id() == self.worker_thread {
            return Err(WorkerError::Reentrant);
        }
        self.rx.recv().map_err(|_| WorkerError::Abandoned)?
    }
}

/// Cloneable, submit-only handle to a [`SessionWorker`].
///
/// Units running on the worker use this to enqueue follow-up work (for
/// example delivering a batch after a read) behind everything already queued.
pub struct WorkerHandle<S> {
    tx: mpsc::UnboundedSender<Command<S>>,
    accepting: Arc<AtomicBool>,
    worker_thread: ThreadId,
}

impl<S> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            accepting: Arc::clone(&self.accepting),
            worker_thread: self.worker_thread,
        }
    }
}

impl<S: 'static> WorkerHandle<S> {
    fn send(&self, command: Command<S>) -> Result<(), WorkerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WorkerError::ShutDown);
        }
        self.tx.send(command).map_err(|_| WorkerError::ShutDown)
    }

    /// Whether the calling thread is the worker thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    /// Enqueue a fire-and-forget unit. Never blocks.
    pub fn execute<F>(&self, work: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(Command::Run(Box::new(move |state: &mut S| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work(state))) {
                error!(panic = %panic_message(payload.as_ref()), "Fire-and-forget unit panicked");
            }
        })))
    }

    /// Enqueue a unit and return a handle to its eventual result. Never blocks.
    pub fn submit<T, F>(&self, work: F) -> Result<JobHandle<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> anyhow::Result<T> + Send + 'static,
    {
        let (response_tx, response_rx) = std_mpsc::sync_channel(1);

        self.send(Command::Run(Box::new(move |state: &mut S| {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| work(state))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cause)) => Err(WorkerError::Failed(cause)),
                Err(payload) => Err(WorkerError::Failed(anyhow!(
                    "unit panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            // The submitter may have stopped waiting
            let _ = response_tx.send(result);
        })))?;

        Ok(JobHandle {
            rx: response_rx,
            worker_thread: self.worker_thread,
        })
    }

    /// Enqueue a unit and block until it has run.
    ///
    /// Every unit submitted earlier completes first. A fault raised by the
    /// unit comes back as [`WorkerError::Failed`] carrying the original cause.
    pub fn submit_and_wait<T, F>(&self, work: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(WorkerError::Reentrant);
        }
        self.submit(work)?.wait()
    }

    /// Run `work` once per `period` after `initial_delay`, until cancelled.
    pub fn schedule_repeating<F>(
        &self,
        work: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<CancelHandle, WorkerError>
    where
        F: FnMut(&mut S) -> ControlFlow<()> + Send + 'static,
    {
        let cancel = CancelHandle::new();
        self.schedule_repeating_with(cancel.clone(), work, initial_delay, period)?;
        Ok(cancel)
    }

    /// Same as [`WorkerHandle::schedule_repeating`], bound to a caller-created
    /// handle so the caller can cancel before the unit is even registered.
    ///
    /// Ticks are spaced at a fixed rate. A tick that overruns its slot is
    /// followed immediately by the next one; missed slots are not replayed.
    /// Returning `ControlFlow::Break` from `work` cancels the unit.
    pub fn schedule_repeating_with<F>(
        &self,
        cancel: CancelHandle,
        work: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<(), WorkerError>
    where
        F: FnMut(&mut S) -> ControlFlow<()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        self.send(Command::Repeat(Periodic {
            work: Box::new(work),
            next_run: Instant::now() + initial_delay,
            period,
            cancel,
        }))
    }
}

/// A single sequential execution context owning a state value `S`.
pub struct SessionWorker<S: 'static> {
    name: String,
    handle: WorkerHandle<S>,
    abort: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    finished: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl<S: 'static> SessionWorker<S> {
    /// Start the worker thread and build its state there with `init`.
    pub fn spawn<F>(name: &str, init: F) -> Result<Self, WorkerError>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = std_mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));
        let thread_abort = Arc::clone(&abort);
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(format!("session-worker-{}", name))
            .spawn(move || {
                debug!(worker = %thread_name, "Starting session worker");
                let mut state = init();
                runtime.block_on(run_queue(&mut state, rx, &thread_abort));
                debug!(worker = %thread_name, "Session worker ended");
                let _ = finished_tx.send(());
            })?;

        let handle = WorkerHandle {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
            worker_thread: thread.thread().id(),
        };

        Ok(Self {
            name: name.to_string(),
            handle,
            abort,
            thread: Mutex::new(Some(thread)),
            finished: Mutex::new(Some(finished_rx)),
        })
    }

    /// A cloneable submit-only handle to this worker.
    pub fn handle(&self) -> WorkerHandle<S> {
        self.handle.clone()
    }

    /// Whether [`SessionWorker::shutdown`] has been requested.
    pub fn is_shut_down(&self) -> bool {
        !self.handle.accepting.load(Ordering::Acquire)
    }

    /// See [`WorkerHandle::execute`].
    pub fn execute<F>(&self, work: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.execute(work)
    }

    /// See [`WorkerHandle::submit`].
    pub fn submit<T, F>(&self, work: F) -> Result<JobHandle<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> anyhow::Result<T> + Send + 'static,
    {
        self.handle.submit(work)
    }

    /// See [`WorkerHandle::submit_and_wait`].
    pub fn submit_and_wait<T, F>(&self, work: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> anyhow::Result<T> + Send + 'static,
    {
        self.handle.submit_and_wait(work)
    }

    /// See [`WorkerHandle::schedule_repeating`].
    pub fn schedule_repeating<F>(
        &self,
        work: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<CancelHandle, WorkerError>
    where
        F: FnMut(&mut S) -> ControlFlow<()> + Send + 'static,
    {
        self.handle.schedule_repeating(work, initial_delay, period)
    }

    /// Stop accepting work, let the queue drain for up to `timeout`, then
    /// abandon whatever is still pending.
    ///
    /// Idempotent and callable from any thread. Returns `true` when the worker
    /// drained and exited within the timeout.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.handle.accepting.swap(false, Ordering::AcqRel) {
            debug!(worker = %self.name, "Shutting down session worker");
            // Queued behind every accepted unit, so those drain first
            let _ = self.handle.tx.send(Command::Shutdown);
        }

        if self.handle.is_worker_thread() {
            // Waiting on ourselves would only burn the timeout
            self.abort.store(true, Ordering::Release);
            return false;
        }

        let finished = match self.finished.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(finished) = finished else {
            return self.thread_is_gone();
        };

        match finished.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                self.join_thread();
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Session worker did not drain in time, abandoning pending work"
                );
                self.abort.store(true, Ordering::Release);
                false
            }
        }
    }

    fn thread_is_gone(&self) -> bool {
        match self.thread.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    fn join_thread(&self) {
        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(worker = %self.name, "Session worker thread panicked");
            }
        }
    }
}

impl<S: 'static> Drop for SessionWorker<S> {
    fn drop(&mut self) {
        if self.handle.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.handle.tx.send(Command::Shutdown);
        }
    }
}

/// Worker loop: queued units take priority over due ticks, so work enqueued
/// by a tick always runs before the next tick of the same schedule.
async fn run_queue<S>(
    state: &mut S,
    mut command_rx: mpsc::UnboundedReceiver<Command<S>>,
    abort: &AtomicBool,
) {
    let mut timers: Vec<Periodic<S>> = Vec::new();

    loop {
        if abort.load(Ordering::Acquire) {
            debug!("Session worker aborted, dropping pending work");
            break;
        }

        timers.retain(|timer| !timer.cancel.is_cancelled());
        let next_due = timers.iter().map(|timer| timer.next_run).min();

        tokio::select! {
            biased;

            command = command_rx.recv() => match command {
                Some(Command::Run(job)) => job(state),
                Some(Command::Repeat(timer)) => {
                    trace!(period_ms = timer.period.as_millis() as u64, "Registered repeating unit");
                    timers.push(timer);
                }
                Some(Command::Shutdown) | None => break,
            },

            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                run_due_timers(state, &mut timers, abort);
            }
        }
    }
}

fn run_due_timers<S>(state: &mut S, timers: &mut [Periodic<S>], abort: &AtomicBool) {
    for timer in timers.iter_mut() {
        if abort.load(Ordering::Acquire) {
            return;
        }
        if timer.cancel.is_cancelled() || timer.next_run > Instant::now() {
            continue;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| (timer.work)(state))) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => timer.cancel.cancel(),
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "Repeating unit panicked, cancelling it");
                timer.cancel.cancel();
            }
        }

        timer.next_run += timer.period;
        let now = Instant::now();
        if timer.next_run < now {
            timer.next_run = now;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant as StdInstant;

    #[test]
    fn test_units_run_in_submission_order() {
        let worker = SessionWorker::spawn("order", Vec::<u32>::new).unwrap();

        for i in 0..100 {
            worker.execute(move |seen| seen.push(i)).unwrap();
        }
        let seen = worker.submit_and_wait(|seen| Ok(seen.clone())).unwrap();

        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(worker.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_units_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let worker = SessionWorker::spawn("overlap", || ()).unwrap();

        let mut callers = Vec::new();
        for _ in 0..8 {
            let handle = worker.handle();
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            callers.push(thread::spawn(move || {
                for _ in 0..10 {
                    let active = Arc::clone(&active);
                    let overlaps = Arc::clone(&overlaps);
                    handle
                        .submit_and_wait(move |_| {
                            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            }));
        }
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_fault_is_returned_with_cause() {
        let worker = SessionWorker::spawn("fault", || ()).unwrap();

        let result: Result<(), _> = worker.submit_and_wait(|_| Err(anyhow!("driver refused")));
        match result {
            Err(WorkerError::Failed(cause)) => assert_eq!(cause.to_string(), "driver refused"),
            other => panic!("unexpected result: {:?}", other),
        }

        // Worker keeps serving after a fault
        assert_eq!(worker.submit_and_wait(|_| Ok(7)).unwrap(), 7);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_panic_is_captured() {
        let worker = SessionWorker::spawn("panic", || ()).unwrap();

        let result: Result<(), _> = worker.submit_and_wait(|_| panic!("native crash"));
        match result {
            Err(WorkerError::Failed(cause)) => assert!(cause.to_string().contains("native crash")),
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(worker.submit_and_wait(|_| Ok(())).is_ok());
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_submit_returns_without_waiting() {
        let worker = SessionWorker::spawn("async-submit", || ()).unwrap();

        let started = StdInstant::now();
        let job = worker
            .submit(|_| {
                thread::sleep(Duration::from_millis(100));
                Ok("done")
            })
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));

        assert_eq!(job.wait().unwrap(), "done");
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_repeating_unit_until_cancelled() {
        let worker = SessionWorker::spawn("repeat", || 0u32).unwrap();

        let cancel = worker
            .schedule_repeating(
                |ticks| {
                    *ticks += 1;
                    ControlFlow::Continue(())
                },
                Duration::from_millis(0),
                Duration::from_millis(5),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(60));
        cancel.cancel();
        // Anything already in flight finishes before this round trip
        let at_cancel = worker.submit_and_wait(|ticks| Ok(*ticks)).unwrap();
        thread::sleep(Duration::from_millis(30));
        let later = worker.submit_and_wait(|ticks| Ok(*ticks)).unwrap();

        assert!(at_cancel >= 2, "expected several ticks, got {}", at_cancel);
        assert!(later <= at_cancel + 1);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_repeating_unit_can_stop_itself() {
        let worker = SessionWorker::spawn("self-stop", || 0u32).unwrap();

        let cancel = worker
            .schedule_repeating(
                |ticks| {
                    *ticks += 1;
                    if *ticks == 3 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
                Duration::from_millis(0),
                Duration::from_millis(2),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(cancel.is_cancelled());
        assert_eq!(worker.submit_and_wait(|ticks| Ok(*ticks)).unwrap(), 3);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_slow_ticks_do_not_pile_up() {
        let worker = SessionWorker::spawn("slow", || 0u32).unwrap();

        let cancel = worker
            .schedule_repeating(
                |ticks| {
                    *ticks += 1;
                    thread::sleep(Duration::from_millis(20));
                    ControlFlow::Continue(())
                },
                Duration::from_millis(0),
                Duration::from_millis(1),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let ticks = worker.submit_and_wait(|ticks| Ok(*ticks)).unwrap();

        // One tick per 20ms at most, not one per 1ms slot
        assert!(ticks <= 7, "ticks piled up: {}", ticks);
        worker.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_drains_then_refuses() {
        let worker = SessionWorker::spawn("drain", || 0u32).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let completed = Arc::clone(&completed);
            worker
                .execute(move |_| {
                    thread::sleep(Duration::from_millis(5));
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(worker.shutdown(Duration::from_secs(2)));
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(worker.is_shut_down());
        assert!(matches!(worker.execute(|_| {}), Err(WorkerError::ShutDown)));
        assert!(matches!(
            worker.submit_and_wait(|_| Ok(())),
            Err(WorkerError::ShutDown)
        ));

        // Idempotent
        assert!(worker.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_shutdown_timeout_abandons_pending_work() {
        let worker = SessionWorker::spawn("stuck", || ()).unwrap();
        let ran_late = Arc::new(AtomicBool::new(false));

        worker
            .execute(|_| thread::sleep(Duration::from_millis(200)))
            .unwrap();
        let flag = Arc::clone(&ran_late);
        worker
            .execute(move |_| flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(!worker.shutdown(Duration::from_millis(20)));
        thread::sleep(Duration::from_millis(300));
        assert!(!ran_late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_blocking_wait_from_runtime_thread() {
        let worker = SessionWorker::spawn("from-async", || 41u32).unwrap();

        worker.execute(|value| *value += 1).unwrap();
        assert_eq!(worker.submit_and_wait(|value| Ok(*value)).unwrap(), 42);

        let job = worker.submit(|value| Ok(*value * 2)).unwrap();
        assert_eq!(job.wait().unwrap(), 84);
        assert!(worker.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_blocking_submit_from_worker_is_rejected() {
        let worker = SessionWorker::spawn("reentrant", || ()).unwrap();
        let handle = worker.handle();

        let inner = worker
            .submit_and_wait(move |_| Ok(handle.submit_and_wait(|_| Ok(()))))
            .unwrap();

        assert!(matches!(inner, Err(WorkerError::Reentrant)));
        worker.shutdown(Duration::from_secs(1));
    }
}
