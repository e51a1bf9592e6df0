//! Process-wide connections-per-second counter

use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

static CURRENT_CPS: AtomicU64 = AtomicU64::new(0);
static LAST_CPS: AtomicU64 = AtomicU64::new(0);
static TICKER: Once = Once::new();

/// record_connection counts one established plain TCP connection
pub(crate) fn record_connection() {
    start_ticker();
    CURRENT_CPS.fetch_add(1, Ordering::Relaxed);
}

/// rate_cps is the number of connections established during the last full second
pub fn rate_cps() -> u64 {
    LAST_CPS.load(Ordering::Relaxed)
}

fn start_ticker() {
    TICKER.call_once(|| {
        let spawned = std::thread::Builder::new()
            .name("dialx-cps".into())
            .spawn(|| {
                loop {
                    std::thread::sleep(Duration::from_secs(1));
                    LAST_CPS.store(CURRENT_CPS.swap(0, Ordering::Relaxed), Ordering::Relaxed);
                }
            });
        if let Err(e) = spawned {
            warn!("cannot start cps ticker: {}", e);
        }
    });
}
