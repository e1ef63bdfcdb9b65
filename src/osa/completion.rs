//! One-shot or streaming hand-off from completion context to a waiter.

#[cfg(feature = "std")]
mod imp {
    use core::time::Duration;
    use std::sync::mpsc;

    pub struct CompletionSender<T> {
        tx: mpsc::Sender<T>,
    }

    pub struct Completion<T> {
        rx: mpsc::Receiver<T>,
    }

    pub fn completion<T>() -> (CompletionSender<T>, Completion<T>) {
        let (tx, rx) = mpsc::channel();
        (CompletionSender { tx }, Completion { rx })
    }

    impl<T> Clone for CompletionSender<T> {
        fn clone(&self) -> Self {
            Self {
                tx: self.tx.clone(),
            }
        }
    }

    impl<T> CompletionSender<T> {
        /// Posts `value`. Returns false when the waiter is gone.
        pub fn complete(&self, value: T) -> bool {
            self.tx.send(value).is_ok()
        }
    }

    impl<T> Completion<T> {
        /// Blocks until a value arrives. `None` once every sender is dropped.
        pub fn wait(&self) -> Option<T> {
            self.rx.recv().ok()
        }

        pub fn try_wait(&self) -> Option<T> {
            self.rx.try_recv().ok()
        }

        pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
            self.rx.recv_timeout(timeout).ok()
        }
    }
}

#[cfg(not(feature = "std"))]
mod imp {
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use core::time::Duration;
    use kspin::SpinNoIrq;

    struct Shared<T> {
        queue: SpinNoIrq<VecDeque<T>>,
    }

    pub struct CompletionSender<T> {
        shared: Arc<Shared<T>>,
    }

    pub struct Completion<T> {
        shared: Arc<Shared<T>>,
    }

    pub fn completion<T>() -> (CompletionSender<T>, Completion<T>) {
        let shared = Arc::new(Shared {
            queue: SpinNoIrq::new(VecDeque::new()),
        });
        (
            CompletionSender {
                shared: shared.clone(),
            },
            Completion { shared },
        )
    }

    impl<T> Clone for CompletionSender<T> {
        fn clone(&self) -> Self {
            Self {
                shared: self.shared.clone(),
            }
        }
    }

    impl<T> CompletionSender<T> {
        pub fn complete(&self, value: T) -> bool {
            if Arc::strong_count(&self.shared) == 1 {
                return false;
            }
            self.shared.queue.lock().push_back(value);
            true
        }
    }

    impl<T> Completion<T> {
        pub fn wait(&self) -> Option<T> {
            loop {
                if let Some(value) = self.try_wait() {
                    return Some(value);
                }
                if Arc::strong_count(&self.shared) == 1 {
                    return None;
                }
                core::hint::spin_loop();
            }
        }

        pub fn try_wait(&self) -> Option<T> {
            self.shared.queue.lock().pop_front()
        }

        pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
            let deadline = super::super::now() + timeout;
            loop {
                if let Some(value) = self.try_wait() {
                    return Some(value);
                }
                if Arc::strong_count(&self.shared) == 1 || super::super::now() >= deadline {
                    return None;
                }
                core::hint::spin_loop();
            }
        }
    }
}

pub use imp::{Completion, CompletionSender, completion};
