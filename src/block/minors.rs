use alloc::vec;
use alloc::vec::Vec;

use kspin::SpinNoIrq;

/// Hands out block device minor indices, smallest free first.
pub struct MinorAllocator {
    used: SpinNoIrq<Vec<bool>>,
}

impl MinorAllocator {
    pub fn new(max: usize) -> Self {
        Self {
            used: SpinNoIrq::new(vec![false; max]),
        }
    }

    pub fn alloc(&self) -> Option<u32> {
        let mut used = self.used.lock();
        let idx = used.iter().position(|u| !u)?;
        used[idx] = true;
        Some(idx as u32)
    }

    pub fn release(&self, minor: u32) {
        if let Some(slot) = self.used.lock().get_mut(minor as usize) {
            *slot = false;
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().iter().filter(|u| **u).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_free_wins() {
        let minors = MinorAllocator::new(4);
        assert_eq!(minors.alloc(), Some(0));
        assert_eq!(minors.alloc(), Some(1));
        assert_eq!(minors.alloc(), Some(2));
        minors.release(1);
        assert_eq!(minors.alloc(), Some(1));
        assert_eq!(minors.alloc(), Some(3));
        assert_eq!(minors.alloc(), None);
        assert_eq!(minors.in_use(), 4);
        minors.release(9);
    }
}
