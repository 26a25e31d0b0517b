//! Dead-node resurrection timer.
//!
//! Armed by the first node failure of a state. Every `dead_timeout` it pings
//! the dead nodes of the current state; revived nodes go back on the hash
//! ring. The timer disarms itself once no node is dead.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::{NodePool, PoolInner};

/// Starts the timer unless one is already running.
pub(super) fn arm(inner: &Arc<PoolInner>) {
    let mut slot = inner.resurrection.lock();
    if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
        return;
    }
    let period = inner.config.dead_timeout();
    debug!(period_ms = period.as_millis(), "arming resurrection timer");
    *slot = Some(tokio::spawn(run(Arc::downgrade(inner), period)));
}

/// Stops a running timer.
pub(super) fn disarm(inner: &PoolInner) {
    if let Some(handle) = inner.resurrection.lock().take() {
        handle.abort();
    }
}

pub(super) fn is_armed(inner: &PoolInner) -> bool {
    inner
        .resurrection
        .lock()
        .as_ref()
        .is_some_and(|handle| !handle.is_finished())
}

async fn run(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if !NodePool::from_inner(inner).resurrect_dead_nodes().await {
            debug!("no dead nodes left, resurrection timer disarmed");
            return;
        }
    }
}
