//! Single-threaded work queue of a connection.

use std::{
    io::{Error, ErrorKind, Result},
    thread::{self, JoinHandle},
};
use tokio::sync::mpsc;

type Work = Box<dyn FnOnce() + Send + 'static>;

#[cfg(test)]
thread_local! {
    static FAIL_SPAWN: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Makes the next work queue started from this thread fail.
#[cfg(test)]
pub(crate) fn fail_next_spawn() {
    FAIL_SPAWN.set(true);
}

/// Runs queued work items one after another on a dedicated thread.
pub(crate) struct WorkQueue {
    tx: mpsc::UnboundedSender<Work>,
    thread: JoinHandle<()>,
}

impl WorkQueue {
    /// Starts the worker thread.
    pub fn new(name: String) -> Result<Self> {
        #[cfg(test)]
        if FAIL_SPAWN.replace(false) {
            return Err(Error::new(ErrorKind::OutOfMemory, "cannot spawn work queue thread"));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
        let thread = thread::Builder::new().name(name).spawn(move || {
            while let Some(work) = rx.blocking_recv() {
                work();
            }
        })?;

        Ok(Self { tx, thread })
    }

    /// Queues `work` for execution.
    pub fn queue(&self, work: Work) -> Result<()> {
        self.tx.send(work).map_err(|_| Error::new(ErrorKind::BrokenPipe, "work queue terminated"))
    }

    /// Runs all queued work and stops the worker thread.
    pub fn destroy(self) {
        let Self { tx, thread } = self;
        drop(tx);

        if thread.thread().id() == thread::current().id() {
            tracing::warn!("work queue destroyed from its own thread, not waiting for it");
            return;
        }

        if thread.join().is_err() {
            tracing::warn!("work queue thread panicked");
        }
    }
}
