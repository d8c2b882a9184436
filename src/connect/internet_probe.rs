//! InternetProbe (§4.8): a one-shot reachability check used to
//! disambiguate a bootstrap failure from an offline device. Issued after a
//! randomized delay so it doesn't fire on every transient bootstrap retry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;

use crate::clock::Sleeper;
use crate::config::CoreConfig;
use crate::error::Result;
use crate::moat::{InternetReachability, MoatClient};

pub struct InternetProbe {
    moat: Rc<MoatClient>,
    sleeper: Rc<dyn Sleeper>,
    delay_min: Duration,
    delay_max: Duration,
    cancelled: Cell<bool>,
    result: RefCell<Option<InternetReachability>>,
}

impl InternetProbe {
    pub fn new(moat: Rc<MoatClient>, sleeper: Rc<dyn Sleeper>, delay_min: Duration, delay_max: Duration) -> Self {
        Self {
            moat,
            sleeper,
            delay_min,
            delay_max,
            cancelled: Cell::new(false),
            result: RefCell::new(None),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn cached_result(&self) -> Option<InternetReachability> {
        *self.result.borrow()
    }

    /// Wait out the randomized delay, then probe. One-shot: a later call
    /// returns the cached result without re-probing.
    pub async fn run(&self, bootstrapped: bool) -> Result<InternetReachability> {
        if let Some(cached) = self.cached_result() {
            return Ok(cached);
        }
        let millis = rand::thread_rng().gen_range(
            self.delay_min.as_millis() as u64..=self.delay_max.as_millis() as u64,
        );
        self.sleeper.sleep(Duration::from_millis(millis)).await;
        self.probe_now(bootstrapped).await
    }

    /// Skip the randomized delay and probe immediately — used when a
    /// transport error arrives before the probe's own delay has elapsed
    /// (§4.6: "if the error arrives first, force-run the probe immediately").
    pub async fn run_immediate(&self, bootstrapped: bool) -> Result<InternetReachability> {
        if let Some(cached) = self.cached_result() {
            return Ok(cached);
        }
        self.probe_now(bootstrapped).await
    }

    async fn probe_now(&self, bootstrapped: bool) -> Result<InternetReachability> {
        if self.cancelled.get() {
            return Ok(InternetReachability::Unknown);
        }
        let reachability = self.moat.test_internet_connection(bootstrapped).await?;
        *self.result.borrow_mut() = Some(reachability);
        Ok(reachability)
    }
}

/// Construct a probe only when the caller asked for internet testing;
/// `None` otherwise so callers can skip the whole disambiguation step.
pub fn build_probe(
    test_internet: bool,
    moat: Rc<MoatClient>,
    sleeper: Rc<dyn Sleeper>,
    config: &CoreConfig,
) -> Option<Rc<InternetProbe>> {
    if test_internet {
        Some(Rc::new(InternetProbe::new(moat, sleeper, config.probe_delay_min, config.probe_delay_max)))
    } else {
        None
    }
}
