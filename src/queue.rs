//! Single-consumer ordered task queue.
//!
//! One worker thread owns the state `S` and runs submitted closures against
//! it strictly in submission order. Producers on any thread only ever hold a
//! [`QueueHandle`], so the state itself needs no lock.

use crate::error::{DispatchError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Task(Task<S>),
    Shutdown,
}

/// Cloneable producer side of a [`SerialQueue`].
pub struct QueueHandle<S> {
    sender: Sender<Message<S>>,
    worker_id: ThreadId,
}

impl<S> Clone for QueueHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            worker_id: self.worker_id,
        }
    }
}

impl<S: 'static> QueueHandle<S> {
    /// Enqueue a task. Returns immediately.
    pub fn queue_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender
            .send(Message::Task(Box::new(task)))
            .map_err(|_| DispatchError::QueueClosed)
    }

    /// Enqueue a task and block until it has run, returning its result.
    ///
    /// Fails with [`DispatchError::Reentrant`] when called from a queued task,
    /// which would otherwise wait on itself forever.
    pub fn run_task<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(DispatchError::Reentrant);
        }

        let (tx, rx) = bounded(1);
        self.queue_task(move |state| {
            let _ = tx.send(task(state));
        })?;

        // A panicking task drops `tx` without sending.
        rx.recv().map_err(|_| DispatchError::QueueClosed)
    }

    /// Wait until everything queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.run_task(|_| ())
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

/// Owner of the worker thread.
///
/// Dropping the queue lets already-queued tasks finish, then joins the worker.
pub struct SerialQueue<S> {
    handle: QueueHandle<S>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> SerialQueue<S> {
    /// Spawn the worker thread with its initial state.
    pub fn start(name: &str, state: S) -> Result<Self> {
        Self::start_with(name, move |_| state)
    }

    /// Spawn the worker thread, building its state on the worker from a
    /// handle to the queue itself so that tasks can enqueue follow-ups.
    pub fn start_with<F>(name: &str, init: F) -> Result<Self>
    where
        F: FnOnce(QueueHandle<S>) -> S + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let worker_sender = sender.clone();

        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            let handle = QueueHandle {
                sender: worker_sender,
                worker_id: thread::current().id(),
            };
            run_worker(receiver, init(handle))
        })?;

        let handle = QueueHandle {
            sender,
            worker_id: worker.thread().id(),
        };

        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> QueueHandle<S> {
        self.handle.clone()
    }

    pub fn queue_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.queue_task(task)
    }

    pub fn run_task<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.run_task(task)
    }

    pub fn flush(&self) -> Result<()> {
        self.handle.flush()
    }
}

impl<S> Drop for SerialQueue<S> {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(Message::Shutdown);

        if let Some(worker) = self.worker.take() {
            // Dropped from inside a task: the worker exits on its own once
            // this task returns.
            if thread::current().id() != self.handle.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker<S>(receiver: Receiver<Message<S>>, mut state: S) {
    while let Ok(message) = receiver.recv() {
        let task = match message {
            Message::Task(task) => task,
            Message::Shutdown => break,
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
            tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "Queued task panicked; continuing with next task"
            );
        }
    }

    tracing::debug!("Task queue worker stopped");
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
