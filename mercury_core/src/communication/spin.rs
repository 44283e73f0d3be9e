//! Process-local named spin registry.
//!
//! One global map from spin name to a held/free flag, used to serialize
//! concurrent callers within one process to the same stream direction.
//! Cross-process exclusion is NOT provided here — the ring's single-writer /
//! single-reader model covers that.
//!
//! Entries are created on first acquire and retained for the process
//! lifetime; [`release_all`] clears the map (teardown in tests). These are
//! cooperative locks with a 1 ms sleep between attempts, not CPU spinlocks.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{MercuryError, MercuryResult};

/// Sleep between acquire attempts.
const ACQUIRE_RETRY_SLEEP: Duration = Duration::from_millis(1);

static REGISTRY: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, bool>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Try to take the named spin, retrying until `timeout`.
///
/// Returns `false` after the deadline; callers treat that as a recoverable
/// timeout. Not reentrant: a second acquire of the same name from the same
/// thread waits out its deadline like any other contender.
pub fn acquire(name: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let mut map = registry().lock();
            let held = map.entry(name.to_string()).or_insert(false);
            if !*held {
                *held = true;
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(ACQUIRE_RETRY_SLEEP);
    }
}

/// Mark the named spin free. Releasing a spin that is not held is a no-op.
pub fn release(name: &str) {
    let mut map = registry().lock();
    if let Some(held) = map.get_mut(name) {
        *held = false;
    }
}

/// Clear the whole registry, releasing every spin.
pub fn release_all() {
    registry().lock().clear();
}

/// RAII guard for a named spin: guaranteed release on every exit path.
pub struct SpinGuard {
    name: String,
}

impl Drop for SpinGuard {
    fn drop(&mut self) {
        release(&self.name);
    }
}

/// Acquire the named spin and return a guard releasing it on drop.
pub fn acquire_scoped(name: &str, timeout: Duration) -> MercuryResult<SpinGuard> {
    if acquire(name, timeout) {
        Ok(SpinGuard {
            name: name.to_string(),
        })
    } else {
        Err(MercuryError::timeout(format!(
            "spin '{}' not acquired within {:?}",
            name, timeout
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!("{}_{}", prefix, COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    fn short() -> Duration {
        Duration::from_millis(50)
    }

    #[test]
    fn mutual_exclusion_within_a_thread() {
        let name = unique_name("spin_mutex");
        assert!(acquire(&name, short()));
        // Second acquire of a held spin waits out its deadline.
        assert!(!acquire(&name, short()));
        release(&name);
        assert!(acquire(&name, short()));
        release(&name);
    }

    #[test]
    fn independent_names_do_not_contend() {
        let a = unique_name("spin_a");
        let b = unique_name("spin_b");
        assert!(acquire(&a, short()));
        assert!(acquire(&b, short()));
        release(&a);
        release(&b);
    }

    #[test]
    fn contended_acquire_succeeds_after_release() {
        let name = unique_name("spin_contended");
        assert!(acquire(&name, short()));

        let name2 = name.clone();
        let waiter = std::thread::spawn(move || acquire(&name2, Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(20));
        release(&name);
        assert!(waiter.join().unwrap());
        release(&name);
    }

    #[test]
    fn guard_releases_on_drop_and_panic() {
        let name = unique_name("spin_guard");
        {
            let _guard = acquire_scoped(&name, short()).unwrap();
            assert!(!acquire(&name, Duration::from_millis(5)));
        }
        assert!(acquire(&name, short()));
        release(&name);

        let name2 = name.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = acquire_scoped(&name2, short()).unwrap();
            panic!("listener blew up");
        });
        assert!(result.is_err());
        // The guard released the spin while unwinding.
        assert!(acquire(&name, short()));
        release(&name);
    }

    #[test]
    fn release_all_clears_everything() {
        let a = unique_name("spin_all_a");
        let b = unique_name("spin_all_b");
        assert!(acquire(&a, short()));
        assert!(acquire(&b, short()));
        release_all();
        assert!(acquire(&a, short()));
        assert!(acquire(&b, short()));
        release(&a);
        release(&b);
    }
}
