use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Shared cancellation flag checked at every step boundary and poll tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` on cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Routes Ctrl+C: while a cancellable flow is running the first press only
/// cancels it; otherwise the press should end the process.
#[derive(Debug, Clone, Default)]
pub struct InterruptRouter {
    token: CancelToken,
    flow_active: Arc<AtomicBool>,
}

/// Marks a flow as running until dropped.
#[derive(Debug)]
pub struct FlowGuard {
    flow_active: Arc<AtomicBool>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.flow_active.store(false, Ordering::SeqCst);
    }
}

impl InterruptRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn enter_flow(&self) -> FlowGuard {
        self.flow_active.store(true, Ordering::SeqCst);
        FlowGuard {
            flow_active: self.flow_active.clone(),
        }
    }

    /// Cancels the token. Returns `true` when the caller should exit now:
    /// no flow is running, or this is a repeated press.
    pub fn interrupt(&self) -> bool {
        let repeated = self.token.is_cancelled();
        self.token.cancel();
        repeated || !self.flow_active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_without_flow_requests_exit() {
        let router = InterruptRouter::new();
        assert!(router.interrupt());
        assert!(router.token().is_cancelled());
    }

    #[test]
    fn interrupt_during_flow_cancels_then_exits_on_second_press() {
        let router = InterruptRouter::new();
        let guard = router.enter_flow();

        assert!(!router.interrupt());
        assert!(router.token().is_cancelled());
        assert!(router.interrupt());
        drop(guard);
    }

    #[test]
    fn finished_flow_no_longer_absorbs_interrupts() {
        let router = InterruptRouter::new();
        drop(router.enter_flow());
        assert!(router.interrupt());
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        canceller.join().expect("join");
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(30)));
        assert!(!token.is_cancelled());
    }
}
