use super::{
    errors::TaskError,
    result::TaskResult,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll}
};
use tokio::{
    sync::oneshot::{self, error::TryRecvError},
    time::Duration,
};


/// Caller side of a task's completion channel.
///
/// Resolves to whatever the handler responded with, or to a [`TaskError`]
/// when the pool had to give up on the task. A completion whose responder
/// vanished without writing resolves to [`TaskError::Abandoned`].
#[derive(Debug)]
pub struct Completion<T> {
    receiver: oneshot::Receiver<TaskResult<T>>,
}

impl<T> Completion<T> {

    pub(crate) fn new(receiver: oneshot::Receiver<TaskResult<T>>) -> Self {
        Self { receiver }
    }

    /// Takes the result if it is already there, without waiting.
    /// Hands the completion back when the task has not finished yet.
    pub fn try_result(mut self) -> Result<TaskResult<T>, Self> {
        match self.receiver.try_recv() {
            Ok(result) => Ok(result),
            Err(TryRecvError::Empty) => Err(self),
            Err(TryRecvError::Closed) => Ok(Err(TaskError::Abandoned)),
        }
    }

    pub async fn await_timeout(self, timeout: Duration) -> TaskResult<T> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Abandoned),
            Err(_) => Err(TaskError::Timeout(timeout)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(res) => Poll::Ready(res.unwrap_or(Err(TaskError::Abandoned))),
            Poll::Pending => Poll::Pending,
        }
    }
}
