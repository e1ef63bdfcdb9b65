/// Binary semaphore used as the host claim gate. Coarser than any
/// spinlock: holders may sleep while owning it.
pub struct Semaphore {
    #[cfg(feature = "std")]
    taken: std::sync::Mutex<bool>,
    #[cfg(feature = "std")]
    released: std::sync::Condvar,
    #[cfg(not(feature = "std"))]
    taken: kspin::SpinNoIrq<bool>,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Semaphore {
    pub fn new() -> Self {
        Self {
            taken: std::sync::Mutex::new(false),
            released: std::sync::Condvar::new(),
        }
    }

    pub fn down(&self) {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        while *taken {
            taken = self
                .released
                .wait(taken)
                .unwrap_or_else(|e| e.into_inner());
        }
        *taken = true;
    }

    pub fn try_down(&self) -> bool {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        if *taken {
            return false;
        }
        *taken = true;
        true
    }

    pub fn up(&self) {
        *self.taken.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.released.notify_one();
    }
}

#[cfg(not(feature = "std"))]
impl Semaphore {
    pub fn new() -> Self {
        Self {
            taken: kspin::SpinNoIrq::new(false),
        }
    }

    pub fn down(&self) {
        while !self.try_down() {
            super::osa_sleep(core::time::Duration::from_micros(100));
        }
    }

    pub fn try_down(&self) -> bool {
        let mut taken = self.taken.lock();
        if *taken {
            return false;
        }
        *taken = true;
        true
    }

    pub fn up(&self) {
        *self.taken.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_claim_waits_for_release() {
        let sem = Arc::new(Semaphore::new());
        sem.down();
        assert!(!sem.try_down());

        let other = sem.clone();
        let handle = std::thread::spawn(move || {
            other.down();
            other.up();
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        sem.up();
        handle.join().unwrap();
        assert!(sem.try_down());
    }
}
