//! Cancellable sleeps for the background loops spawned by `Coordinator::start`
//! (§5: loops select on the service's own long-lived cancellation signal and
//! exit promptly on `stop()`, not on the caller's per-call `ctx`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_STEP: Duration = Duration::from_secs(1);

/// Sleeps for `duration`, polling `running` every second so a loop waiting
/// on a long interval still exits within ~1s of `stop()`. Returns `false`
/// if cancelled during the sleep, `true` if the full duration elapsed.
pub async fn sleep_cancellable(duration: Duration, running: &Arc<AtomicBool>) -> bool {
    let mut waited = Duration::ZERO;
    while waited < duration {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let step = POLL_STEP.min(duration - waited);
        async_std::task::sleep(step).await;
        waited += step;
    }
    running.load(Ordering::SeqCst)
}
