use super::{
    errors::{PoolError, TaskError},
    task::{panic_message, Blocking, Task, TaskFunc},
};
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use crossbeam::deque::{Injector, Steal};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::Notify,
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};


/// Worker count used when [`Config::workers`] is zero.
pub const DEFAULT_WORKERS: usize = 3;

/// What [`Pool::add`] does when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Fail the new task with [`TaskError::Rejected`] and return [`PoolError::QueueFull`].
    #[default]
    Reject,
    /// Fail the oldest queued task with [`TaskError::Dropped`] and queue the new one.
    DropOldest,
    /// Hand the enqueue to a spawned task that waits for room.
    /// Deferred enqueues are not bounded.
    Defer,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker loops; `0` selects [`DEFAULT_WORKERS`].
    /// Exactly this many loops are spawned (never `workers + 1`).
    pub workers: usize,
    /// Queue capacity, `None` for an unbounded queue.
    pub max_pending: Option<usize>,
    pub overflow: Overflow,
    /// Upper bound on how long [`Pool::submit`] waits for queue room.
    pub submit_timeout: Option<Duration>,
    /// Upper bound on a single handler run.
    pub task_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            max_pending: None,
            overflow: Overflow::Reject,
            submit_timeout: None,
            task_timeout: None,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus,
            max_pending: Some(num_cpus * 10),
            overflow: Overflow::Reject,
            submit_timeout: Some(Duration::from_secs(30)),
            task_timeout: Some(Duration::from_secs(60)),
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2,
            max_pending: None,
            overflow: Overflow::Reject,
            submit_timeout: None,
            task_timeout: Some(Duration::from_secs(30)),
        }
    }

    #[inline]
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 { DEFAULT_WORKERS } else { self.workers }
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.max_pending == Some(0) {
            return Err(PoolError::InvalidConfig("max_pending must be greater than zero".into()));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(PoolError::InvalidConfig("task_timeout must be non-zero".into()));
        }
        Ok(())
    }
}


/// Construction options: configuration plus the handler every worker runs.
pub struct Options<I, O> {
    pub config: Config,
    pub handler: Option<Arc<dyn TaskFunc<I, O>>>,
}

impl<I, O> Default for Options<I, O> {
    fn default() -> Self {
        Self {
            config: Config::default(),
            handler: None,
        }
    }
}

impl<I, O> Options<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: TaskFunc<I, O>,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn blocking_handler<F>(mut self, handler: F) -> Self
    where
        Blocking<F>: TaskFunc<I, O>,
    {
        self.handler = Some(Arc::new(Blocking::new(handler)));
        self
    }
}


struct Inner<I, O> {
    queue: Injector<Task<I, O>>,
    task_notify: Notify,
    space_notify: Notify,
    idle_notify: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
    // reserved queue slots; never below the number of queued tasks
    queued: AtomicUsize,
    // accepted and not yet finished: queued, deferred or running
    in_flight: AtomicUsize,
    handler: Arc<dyn TaskFunc<I, O>>,
    runtime: Handle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    config: Config,
}

/// Decrements the in-flight count when a handler run ends, aborted or not.
struct RunGuard<'a, I, O>(&'a Inner<I, O>);

impl<I, O> Drop for RunGuard<'_, I, O> {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

impl<I, O> Inner<I, O> {
    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    fn accept(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_notify.notify_waiters();
        }
    }

    fn try_reserve(&self) -> bool {
        match self.config.max_pending {
            None => {
                self.queued.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(cap) => self
                .queued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
                .is_ok(),
        }
    }

    /// Pushes a task into a slot reserved with `try_reserve`.
    fn push(&self, task: Task<I, O>) {
        self.queue.push(task);
        self.task_notify.notify_one();

        // raced with shutdown: nobody will pop this anymore
        if self.is_closed() {
            self.drain(TaskError::Shutdown);
        }
    }

    fn pop(&self) -> Option<Task<I, O>> {
        loop {
            match self.queue.steal() {
                Steal::Success(task) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    self.space_notify.notify_one();
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    fn push_displacing(&self, task: Task<I, O>) {
        while !self.try_reserve() {
            match self.pop() {
                Some(oldest) => {
                    debug!("queue full, dropping oldest task");
                    oldest.output.fail(TaskError::Dropped);
                    self.finish_one();
                }
                None => std::hint::spin_loop(),
            }
        }
        self.push(task);
    }

    async fn reserve_wait(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        let wait = async {
            loop {
                if self.is_closed() {
                    return Err(PoolError::Closed);
                }
                if self.try_reserve() {
                    // pass the wake-up on in case more room is left
                    self.space_notify.notify_one();
                    return Ok(());
                }
                tokio::select! {
                    _ = self.space_notify.notified() => {}
                    _ = self.cancel.cancelled() => return Err(PoolError::Closed),
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Err(PoolError::SubmitTimeout(limit))),
            None => wait.await,
        }
    }

    async fn enqueue_deferred(&self, task: Task<I, O>) {
        match self.reserve_wait(None).await {
            Ok(()) => self.push(task),
            Err(err) => {
                debug!(error = %err, "deferred enqueue abandoned");
                task.output.fail(TaskError::Shutdown);
                self.finish_one();
            }
        }
    }

    fn drain(&self, err: TaskError) -> usize {
        let mut drained = 0;
        while let Some(task) = self.pop() {
            task.output.fail(err.clone());
            self.finish_one();
            drained += 1;
        }
        drained
    }

    async fn worker_loop(&self, id: usize)
    where
        I: 'static,
        O: 'static,
    {
        debug!(worker = id, "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.pop() {
                Some(task) => {
                    // one stored permit can stand for several pushes
                    if !self.queue.is_empty() {
                        self.task_notify.notify_one();
                    }
                    self.run(id, task).await
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.task_notify.notified() => {}
                    }
                }
            }
        }

        debug!(worker = id, "worker stopped");
    }

    async fn run(&self, id: usize, mut task: Task<I, O>)
    where
        I: 'static,
        O: 'static,
    {
        let _guard = RunGuard(self);
        task.assign(id);
        let output = task.output.share();
        trace!(worker = id, "dispatching task");

        let handler = &self.handler;
        let call = AssertUnwindSafe(async move { handler.call(task).await }).catch_unwind();

        let outcome = match self.config.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(res) => res.map_err(|payload| TaskError::Panic(panic_message(&*payload))),
                Err(_) => Err(TaskError::Timeout(limit)),
            },
            None => call
                .await
                .map_err(|payload| TaskError::Panic(panic_message(&*payload))),
        };

        match outcome {
            Ok(()) => {
                output.fail(TaskError::NoResponse);
            }
            Err(err) => {
                warn!(worker = id, label = err.as_label(), error = %err, "task failed");
                output.fail(err);
            }
        }
    }
}


/// Fixed-size worker pool.
///
/// Cloning is cheap and yields another handle to the same pool. Workers keep
/// running until [`Pool::shutdown`] is called; dropping every handle does not
/// stop them.
pub struct Pool<I, O> {
    inner: Arc<Inner<I, O>>,
}

impl<I, O> Clone for Pool<I, O> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<I, O> fmt::Debug for Pool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.inner.num_workers)
            .field("queued", &self.inner.queued.load(Ordering::Relaxed))
            .field("pending", &self.inner.in_flight.load(Ordering::Relaxed))
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl<I, O> Pool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Validates `options` and spawns the worker loops on the current tokio runtime.
    pub fn new(options: Options<I, O>) -> Result<Self, PoolError> {
        let Options { config, handler } = options;
        let handler = handler.ok_or(PoolError::MissingHandler)?;
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let num_workers = config.resolved_workers();

        let inner = Arc::new(Inner {
            queue: Injector::new(),
            task_notify: Notify::new(),
            space_notify: Notify::new(),
            idle_notify: Notify::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            handler,
            runtime,
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            num_workers,
            config,
        });

        // spawn exactly `num_workers` loops
        let handles: Vec<_> = (0..num_workers)
            .map(|id| {
                let inner_clone = Arc::clone(&inner);
                inner.runtime.spawn(async move {
                    inner_clone.worker_loop(id).await;
                })
            })
            .collect();
        *inner.workers.lock() = handles;

        info!(
            workers = num_workers,
            max_pending = ?inner.config.max_pending,
            overflow = ?inner.config.overflow,
            "worker pool started"
        );

        Ok(Self { inner })
    }

    /// Queues `task` without waiting for a worker or for room.
    ///
    /// On error the task has already been failed, so its completion resolves.
    pub fn add(&self, task: Task<I, O>) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.is_closed() {
            task.output.fail(TaskError::Shutdown);
            return Err(PoolError::Closed);
        }

        if inner.try_reserve() {
            inner.accept();
            inner.push(task);
            return Ok(());
        }

        let capacity = inner.config.max_pending.unwrap_or(usize::MAX);
        match inner.config.overflow {
            Overflow::Reject => {
                debug!(capacity, "queue full, rejecting task");
                task.output.fail(TaskError::Rejected);
                Err(PoolError::QueueFull { capacity })
            }
            Overflow::DropOldest => {
                inner.accept();
                inner.push_displacing(task);
                Ok(())
            }
            Overflow::Defer => {
                inner.accept();
                let inner_clone = Arc::clone(inner);
                inner.runtime.spawn(async move {
                    inner_clone.enqueue_deferred(task).await;
                });
                Ok(())
            }
        }
    }

    /// Queues `task`, waiting for room in a bounded queue up to
    /// [`Config::submit_timeout`].
    pub async fn submit(&self, task: Task<I, O>) -> Result<(), PoolError> {
        let inner = &self.inner;
        match inner.reserve_wait(inner.config.submit_timeout).await {
            Ok(()) => {
                inner.accept();
                inner.push(task);
                Ok(())
            }
            Err(err) => {
                let reason = match err {
                    PoolError::Closed => TaskError::Shutdown,
                    _ => TaskError::Rejected,
                };
                task.output.fail(reason);
                Err(err)
            }
        }
    }

    /// Waits until every accepted task has finished. Does not stop the pool.
    pub async fn join(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }

    /// Stops accepting tasks, lets running handlers finish, joins the workers
    /// and fails whatever is still queued with [`TaskError::Shutdown`].
    pub async fn shutdown(&self) {
        self.stop(None).await;
    }

    /// Like [`Pool::shutdown`], but aborts workers still busy after `grace`.
    /// Returns `false` when that happened.
    pub async fn shutdown_timeout(&self, grace: Duration) -> bool {
        self.stop(Some(grace)).await
    }

    async fn stop(&self, grace: Option<Duration>) -> bool {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::SeqCst) {
            info!(pending = inner.in_flight.load(Ordering::Relaxed), "worker pool shutting down");
        }
        inner.cancel.cancel();

        let mut handles = std::mem::take(&mut *inner.workers.lock());
        let join = async {
            for handle in handles.iter_mut() {
                if let Err(err) = handle.await {
                    warn!(error = %err, "worker exited abnormally");
                }
            }
        };

        let clean = match grace {
            Some(grace) => tokio::time::timeout(grace, join).await.is_ok(),
            None => {
                join.await;
                true
            }
        };

        if !clean {
            warn!(grace = ?grace, "shutdown grace exceeded, aborting workers");
            let stuck: Vec<_> = handles.into_iter().filter(|h| !h.is_finished()).collect();
            for handle in &stuck {
                handle.abort();
            }
            for handle in stuck {
                let _ = handle.await;
            }
        }

        let drained = inner.drain(TaskError::Shutdown);
        if drained > 0 {
            debug!(drained, "failed queued tasks on shutdown");
        }
        clean
    }

    /// Number of worker loops.
    #[inline]
    pub fn workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Accepted tasks that have not finished yet.
    #[inline]
    pub fn pending(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// `true` if both handles refer to the same pool.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Returns the pool, or panics with the construction error.
///
/// For call sites that treat pool construction as infallible.
pub fn must<I, O>(result: Result<Pool<I, O>, PoolError>) -> Pool<I, O> {
    match result {
        Ok(pool) => pool,
        Err(err) => panic!("worker pool construction failed: {err}"),
    }
}
