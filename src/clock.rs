//! Sleeper contract: the one non-network suspension point besides
//! fetch (§5: "The randomized timer in InternetProbe" / "The 12-hour
//! background interval in LoxClient"). Grounded on the teacher's
//! `runtime::sleep::WasmSleep`, which wraps a browser `setTimeout` in
//! a `Future`; this crate uses `gloo-timers` for the same effect since
//! it is already pulled in for InternetProbe's randomized delay.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait(?Send)]
pub trait Sleeper {
    async fn sleep(&self, duration: Duration);
}

#[cfg(target_arch = "wasm32")]
pub struct WasmSleeper;

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl Sleeper for WasmSleeper {
    async fn sleep(&self, duration: Duration) {
        gloo_timers::future::TimeoutFuture::new(duration.as_millis() as u32).await;
    }
}

/// Test double: resolves immediately, recording every requested
/// duration so scenario tests can assert on scheduling without
/// actually waiting real wall-clock time.
#[derive(Default)]
pub struct ImmediateSleeper {
    requested: std::cell::RefCell<Vec<Duration>>,
}

impl ImmediateSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested_durations(&self) -> Vec<Duration> {
        self.requested.borrow().clone()
    }
}

#[async_trait(?Send)]
impl Sleeper for ImmediateSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.borrow_mut().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_sleeper_records_requested_durations() {
        futures::executor::block_on(async {
            let sleeper = ImmediateSleeper::new();
            sleeper.sleep(Duration::from_secs(5)).await;
            assert_eq!(sleeper.requested_durations(), vec![Duration::from_secs(5)]);
        });
    }
}
