//! Time budgets, timed lock acquisition and sync-word polling.

use std::time::{Duration, Instant};

use hydra_dev::Region;

use crate::{Error, Result};

/// A call's time budget.
///
/// `BLOCK` waits indefinitely; `TEST` fails immediately when it would
/// have to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Wait as long as it takes.
    pub const BLOCK: Timeout = Timeout(None);

    /// Never wait.
    pub const TEST: Timeout = Timeout(Some(Duration::ZERO));

    pub const fn from_millis(ms: u64) -> Self {
        Timeout(Some(Duration::from_millis(ms)))
    }

    pub(crate) fn deadline(&self) -> Deadline {
        Deadline {
            at: self.0.map(|d| Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout(Some(d))
    }
}

/// An absolute deadline derived from a [`Timeout`] at call entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Milliseconds left, clamped for APIs that need a number.
    pub fn remaining_ms(&self) -> u64 {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => u64::MAX,
        }
    }
}

/// Acquire a spin lock, giving up at the deadline.
pub(crate) fn lock_timeout<'a, T>(
    lock: &'a spin::Mutex<T>,
    deadline: &Deadline,
) -> Option<spin::MutexGuard<'a, T>> {
    loop {
        if let Some(guard) = lock.try_lock() {
            return Some(guard);
        }
        if deadline.expired() {
            return None;
        }
        std::hint::spin_loop();
    }
}

/// Spin on a sync byte until it carries `expected` or the deadline hits.
///
/// Deadlines come from a monotonic clock; the wait itself never yields.
pub(crate) fn sync_wait(
    region: &Region,
    offset: usize,
    expected: u8,
    deadline: &Deadline,
) -> Result<()> {
    while region.load_u8(offset) != expected {
        if deadline.expired() {
            return Err(Error::Timeout);
        }
        std::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_never_expires() {
        let d = Timeout::BLOCK.deadline();
        assert!(!d.expired());
        assert_eq!(d.remaining_ms(), u64::MAX);
    }

    #[test]
    fn test_test_expires_immediately() {
        let d = Timeout::TEST.deadline();
        assert!(d.expired());
    }

    #[test]
    fn test_lock_timeout_gives_up() {
        let lock = spin::Mutex::new(());
        let _held = lock.lock();

        let d = Timeout::from_millis(10).deadline();
        assert!(lock_timeout(&lock, &d).is_none());
    }

    #[test]
    fn test_sync_wait_sees_value() {
        let region = Region::alloc(64).unwrap();
        region.store_u8(3, 42);

        let d = Timeout::from_millis(100).deadline();
        assert!(sync_wait(&region, 3, 42, &d).is_ok());
        assert!(matches!(
            sync_wait(&region, 4, 42, &d),
            Err(Error::Timeout)
        ));
    }
}
