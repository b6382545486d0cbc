use std::sync::{Arc, Mutex};

use cfg_if::cfg_if;
use tracing::warn;

/// Occupancy bitmap of the cores jobs may be pinned to.
#[derive(Debug, Clone)]
pub struct CorePins {
    used: Arc<Mutex<Vec<bool>>>,
}

impl CorePins {
    #[inline]
    pub fn new(cores: usize) -> Self {
        Self {
            used: Arc::new(Mutex::new(vec![false; cores])),
        }
    }

    /// Claims the lowest free core. The core is released when the returned
    /// guard is dropped, including during unwinding.
    #[inline]
    pub fn claim(&self) -> Option<CoreClaim> {
        let mut used = self.used.lock().expect("core pin mutex poisoned");
        let core = used.iter().position(|in_use| !in_use)?;
        used[core] = true;
        drop(used);

        Some(CoreClaim {
            core,
            pins: self.clone(),
        })
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.used.lock().expect("core pin mutex poisoned").iter().filter(|in_use| **in_use).count()
    }

    fn release(&self, core: usize) {
        // Avoid a double panic if a job panicked while holding the lock
        let Ok(mut used) = self.used.lock() else {
            return;
        };
        if let Some(slot) = used.get_mut(core) {
            debug_assert!(*slot, "core {core} released twice");
            *slot = false;
        }
    }
}

/// A claimed core; dropping it frees the core.
#[derive(Debug)]
pub struct CoreClaim {
    core: usize,
    pins: CorePins,
}

impl CoreClaim {
    #[inline]
    pub const fn core(&self) -> usize {
        self.core
    }

    /// Pins the calling thread to the claimed core. Processes spawned from the
    /// thread afterwards inherit the mask.
    #[inline]
    pub fn pin_current_thread(&self) {
        cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "windows"))] {
                if let Err(e) = affinity::set_thread_affinity([self.core]) {
                    warn!("failed to pin worker thread to core {}: {e}", self.core);
                }
            } else {
                warn!("core pinning is not supported on this platform (core {})", self.core);
            }
        }
    }
}

impl Drop for CoreClaim {
    #[inline]
    fn drop(&mut self) {
        self.pins.release(self.core);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, panic, thread};

    use super::*;

    #[test]
    fn claims_lowest_free_core() {
        let pins = CorePins::new(3);
        let first = pins.claim().unwrap();
        let second = pins.claim().unwrap();
        assert_eq!((first.core(), second.core()), (0, 1));

        drop(first);
        let third = pins.claim().unwrap();
        assert_eq!(third.core(), 0);
        assert_eq!(pins.in_use(), 2);
    }

    #[test]
    fn exhausted_pins() {
        let pins = CorePins::new(1);
        let _held = pins.claim().unwrap();
        assert!(pins.claim().is_none());
    }

    #[test]
    fn released_when_holder_panics() {
        let pins = CorePins::new(2);
        let worker_pins = pins.clone();
        let result = thread::spawn(move || {
            let _claim = worker_pins.claim().unwrap();
            panic!("job exploded");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pins.in_use(), 0);

        let outcome = panic::catch_unwind(|| {
            let _claim = pins.claim().unwrap();
            panic!("again");
        });
        assert!(outcome.is_err());
        assert_eq!(pins.in_use(), 0);
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let pins = CorePins::new(4);
        let claimed: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|| pins.claim())).collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        let cores: HashSet<_> = claimed.iter().flatten().map(CoreClaim::core).collect();
        assert_eq!(cores.len(), 4);
    }
}
