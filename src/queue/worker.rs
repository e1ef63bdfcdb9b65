//! A thread that owns a queue and runs it whenever producers post work.

use std::thread::{self, JoinHandle};

use log::{debug, info};

use super::{MmcQueue, QueueHandle, WorkerState};
use crate::common::err::{MmcError, MmcResult};
use crate::host::MmcHostOps;

pub struct QueueWorker {
    handle: QueueHandle,
    thread: Option<JoinHandle<()>>,
}

impl QueueWorker {
    /// Moves `queue` onto its own thread. The queue is drained before the
    /// thread exits.
    pub fn spawn<T: MmcHostOps + 'static>(mut queue: MmcQueue<T>) -> MmcResult<Self> {
        let handle = queue.handle();
        let name = queue.name().to_string();
        let thread = thread::Builder::new()
            .name(format!("{}-queue", name))
            .spawn(move || {
                let handle = queue.handle();
                info!("{}: worker up", queue.name());
                loop {
                    if handle.is_stopped() {
                        break;
                    }
                    if queue.run_once() {
                        continue;
                    }
                    if handle.prepare_sleep() {
                        thread::park();
                    }
                }
                queue.drain();
                handle.set_state(WorkerState::Stopped);
                debug!("{}: worker down", queue.name());
            })
            .map_err(|_| MmcError::NoMemory)?;

        let waker = thread.thread().clone();
        handle.set_waker(move || waker.unpark());
        // anything posted before the waker existed
        handle.request_fn();
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Finishes outstanding work and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.stop();
            let _ = thread.join();
        }
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
