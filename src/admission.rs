//! Admission control
//!
//! Bounds the number of executions in flight. Rejects instead of queueing:
//! a caller that cannot get a permit answers 429 without provisioning anything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Process-wide concurrency gate, created once at service start
#[derive(Debug)]
pub struct AdmissionController {
    capacity: usize,
    in_flight: AtomicUsize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                debug!(in_flight = current, capacity = self.capacity, "admission rejected");
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        controller: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "admission slot released twice");
    }
}

/// One admitted execution. The slot is returned when this is dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_beyond_capacity() {
        let controller = AdmissionController::new(2);

        let first = controller.try_acquire();
        let second = controller.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(controller.try_acquire().is_none());
        assert_eq!(controller.in_flight(), 2);
    }

    #[test]
    fn test_drop_releases_slot() {
        let controller = AdmissionController::new(1);

        let permit = controller.try_acquire().unwrap();
        assert!(controller.try_acquire().is_none());
        drop(permit);

        assert_eq!(controller.in_flight(), 0);
        assert!(controller.try_acquire().is_some());
    }

    #[test]
    fn test_released_on_panic() {
        let controller = AdmissionController::new(1);
        let inner = Arc::clone(&controller);

        let result = std::panic::catch_unwind(move || {
            let _permit = inner.try_acquire().unwrap();
            panic!("execution blew up");
        });

        assert!(result.is_err());
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let controller = AdmissionController::new(3);
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    controller.try_acquire()
                })
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), 3);
        assert_eq!(controller.in_flight(), 3);
        drop(permits);
        assert_eq!(controller.in_flight(), 0);
    }
}
