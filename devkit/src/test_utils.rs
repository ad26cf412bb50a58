/*!
Async helpers shared by tests.
*/

use std::time::{Duration, Instant};

/// Init env_logger once; later calls are no-ops.
pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Poll `cond` every 10ms until it holds or `limit` elapsed.
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= limit {
            log::warn!("⏰ condition not met after {limit:?}");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
