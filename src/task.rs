//! Units of work and the handlers that process them.

use super::{
    errors::TaskError,
    handle::Completion,
    result::TaskResult,
};
use std::{
    any::Any,
    future::Future,
    sync::Arc,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;


struct Slot<T> {
    sender: Option<oneshot::Sender<TaskResult<T>>>,
    answered: bool,
}

/// Write side of a task's completion channel.
///
/// Holds at most one pending write. The pool keeps its own reference to the
/// slot so it can report a failure when the handler could not respond.
pub struct Responder<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Responder<T> {
    fn pair() -> (Self, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (Self::with_sender(Some(tx)), Completion::new(rx))
    }

    fn detached() -> Self {
        Self::with_sender(None)
    }

    fn with_sender(sender: Option<oneshot::Sender<TaskResult<T>>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot { sender, answered: false })),
        }
    }

    pub(crate) fn share(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }

    /// Writes the result. Returns `false` if a result was already written,
    /// the task is detached, or the caller dropped its [`Completion`].
    pub fn send(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn fail(&self, err: TaskError) -> bool {
        self.settle(Err(err))
    }

    /// `true` once a value or an error has been written.
    pub fn is_answered(&self) -> bool {
        self.slot.lock().answered
    }

    /// `true` once nothing written here can reach a caller anymore.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().sender.as_ref().map_or(true, |tx| tx.is_closed())
    }

    fn settle(&self, result: TaskResult<T>) -> bool {
        let sender = {
            let mut slot = self.slot.lock();
            let sender = slot.sender.take();
            if sender.is_some() {
                slot.answered = true;
            }
            sender
        };
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// A unit of work: an input payload plus the responder for its result.
pub struct Task<I, O> {
    pub input: I,
    pub output: Responder<O>,
    worker: Option<usize>,
}

impl<I, O> Task<I, O> {
    /// Creates a task together with the completion its result arrives on.
    pub fn new(input: I) -> (Self, Completion<O>) {
        let (output, completion) = Responder::pair();
        (Self { input, output, worker: None }, completion)
    }

    /// Creates a task nobody waits on; responding to it is a no-op.
    pub fn detached(input: I) -> Self {
        Self {
            input,
            output: Responder::detached(),
            worker: None,
        }
    }

    #[inline]
    pub fn respond(self, value: O) -> bool {
        self.output.send(value)
    }

    /// Index of the worker running this task, `None` until dispatched.
    #[inline]
    pub fn worker_id(&self) -> Option<usize> {
        self.worker
    }

    pub fn into_parts(self) -> (I, Responder<O>) {
        (self.input, self.output)
    }

    pub(crate) fn assign(&mut self, worker: usize) {
        self.worker = Some(worker);
    }
}

/// Handler invoked by a worker for every task it dequeues.
///
/// Implemented for every `Fn(Task<I, O>) -> impl Future<Output = ()>`.
/// The handler is shared by all workers and may run concurrently with itself.
pub trait TaskFunc<I, O>: Send + Sync + 'static {
    fn call(&self, task: Task<I, O>) -> BoxFuture<'static, ()>;
}

impl<I, O, F, Fut> TaskFunc<I, O> for F
where
    F: Fn(Task<I, O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, task: Task<I, O>) -> BoxFuture<'static, ()> {
        Box::pin(self(task))
    }
}

/// Adapts a synchronous handler: each call runs on tokio's blocking pool
/// while the worker that dequeued the task waits for it.
pub struct Blocking<F>(Arc<F>);

impl<F> Blocking<F> {
    pub fn new(f: F) -> Self {
        Self(Arc::new(f))
    }
}

impl<I, O, F> TaskFunc<I, O> for Blocking<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Task<I, O>) + Send + Sync + 'static,
{
    fn call(&self, task: Task<I, O>) -> BoxFuture<'static, ()> {
        let f = Arc::clone(&self.0);
        Box::pin(async move {
            if let Err(err) = tokio::task::spawn_blocking(move || f(task)).await {
                // surface the panic to the worker's recovery boundary
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_writes_once() {
        let (task, completion) = Task::<u8, u8>::new(1);
        let second = task.output.share();
        assert!(task.respond(7));
        assert!(!second.send(8));
        assert!(second.is_closed());
        assert_eq!(completion.await, Ok(7));
    }

    #[test]
    fn detached_task_is_closed() {
        let task = Task::<(), u8>::detached(());
        assert!(task.output.is_closed());
        assert!(!task.respond(1));
    }

    #[tokio::test]
    async fn dropped_task_abandons_completion() {
        let (task, completion) = Task::<(), u8>::new(());
        drop(task);
        assert_eq!(completion.await, Err(TaskError::Abandoned));
    }

    #[test]
    fn responder_tracks_answer() {
        let (task, _completion) = Task::<u8, u8>::new(1);
        let (input, output) = task.into_parts();
        assert_eq!(input, 1);
        assert!(!output.is_answered());
        assert!(output.fail(TaskError::NoResponse));
        assert!(output.is_answered());
        assert!(!output.send(2));

        let detached = Task::<u8, u8>::detached(0);
        assert!(!detached.output.is_answered());
    }

    #[tokio::test]
    async fn try_result_hands_back_pending_completion() {
        let (task, completion) = Task::<u8, u8>::new(3);
        let completion = match completion.try_result() {
            Err(pending) => pending,
            Ok(result) => panic!("result before respond: {result:?}"),
        };

        assert!(task.respond(3));
        assert_eq!(completion.await, Ok(3));
    }

    #[test]
    fn try_result_takes_ready_result() {
        let (task, completion) = Task::<u8, u8>::new(3);
        assert!(task.respond(3));
        assert!(matches!(completion.try_result(), Ok(Ok(3))));

        let (task, completion) = Task::<u8, u8>::new(4);
        drop(task);
        assert!(matches!(completion.try_result(), Ok(Err(TaskError::Abandoned))));
    }

    #[test]
    fn panic_message_variants() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u32), "non-string panic payload");
    }
}
