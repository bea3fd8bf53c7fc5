use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use std::hint;
use std::thread;
use std::time::Duration;

/// How a blocked producer or stage passes time between polls.
///
/// None of these change what is waited for: the condition is re-polled after
/// every step, so a strategy only trades CPU for hand-off latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Tight loop with a CPU spin hint
    #[default]
    BusySpin,
    /// Spin with exponential backoff, then yield the thread
    Yielding,
    /// Exponential sleep, capped at `max_micros`
    Sleeping { max_micros: u64 },
}

/// Spin-wait state for one blocking call
#[derive(Debug)]
pub struct SpinWait {
    strategy: WaitStrategy,
    backoff: Backoff,
    iterations: u32,
}

impl SpinWait {
    /// Create a new spin-wait using `strategy`
    pub fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            backoff: Backoff::new(),
            iterations: 0,
        }
    }

    /// Pass time once
    pub fn spin(&mut self) {
        match self.strategy {
            WaitStrategy::BusySpin => hint::spin_loop(),
            WaitStrategy::Yielding => self.backoff.snooze(),
            WaitStrategy::Sleeping { max_micros } => {
                let backoff_micros = (1u64 << self.iterations.min(10)).min(max_micros.max(1));
                thread::sleep(Duration::from_micros(backoff_micros));
            }
        }
        self.iterations = self.iterations.saturating_add(1);
    }

    /// Number of `spin` calls since creation or the last reset
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Start over from the shortest backoff
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.iterations = 0;
    }

    /// Poll `condition` until it holds or `keep_going` returns false.
    ///
    /// Returns `true` once the condition held, `false` if cancelled first.
    pub fn until<C, K>(&mut self, mut condition: C, mut keep_going: K) -> bool
    where
        C: FnMut() -> bool,
        K: FnMut() -> bool,
    {
        loop {
            if condition() {
                return true;
            }
            if !keep_going() {
                return false;
            }
            self.spin();
        }
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new(WaitStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_until_returns_immediately_when_ready() {
        let mut wait = SpinWait::new(WaitStrategy::BusySpin);
        assert!(wait.until(|| true, || false));
        assert_eq!(wait.iterations(), 0);
    }

    #[test]
    fn test_until_counts_iterations() {
        let mut polls = 0;
        let mut wait = SpinWait::new(WaitStrategy::Yielding);
        assert!(wait.until(
            || {
                polls += 1;
                polls > 3
            },
            || true
        ));
        assert_eq!(wait.iterations(), 3);
        wait.reset();
        assert_eq!(wait.iterations(), 0);
    }

    #[test]
    fn test_until_cancelled() {
        let mut wait = SpinWait::new(WaitStrategy::Sleeping { max_micros: 10 });
        let mut budget = 5;
        let done = wait.until(
            || false,
            || {
                budget -= 1;
                budget > 0
            },
        );
        assert!(!done);
        assert_eq!(wait.iterations(), 4);
    }

    #[test]
    fn test_until_observes_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            setter.store(true, Ordering::Release);
        });

        let mut wait = SpinWait::new(WaitStrategy::Sleeping { max_micros: 100 });
        assert!(wait.until(|| flag.load(Ordering::Acquire), || true));
        handle.join().unwrap();
    }

    #[test]
    fn test_strategy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            wait: WaitStrategy,
        }
        let w: Wrapper = toml::from_str("wait = { kind = \"sleeping\", max_micros = 50 }").unwrap();
        assert_eq!(w.wait, WaitStrategy::Sleeping { max_micros: 50 });
        let w: Wrapper = toml::from_str("wait = { kind = \"busy_spin\" }").unwrap();
        assert_eq!(w.wait, WaitStrategy::BusySpin);
    }
}
