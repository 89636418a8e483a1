//! Shared fixtures for tracerelay's integration tests.
//!
//! - `builders`: config and raw-step builders
//! - `fake_adapter`: scripted in-memory debug adapter
//! - `fake_provisioner`: worker provisioner with injectable failures

pub mod builders;
pub mod fake_adapter;
pub mod fake_provisioner;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Default budget for anything a test awaits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber once per test binary.
///
/// Output is captured per test and shown only for failures. The filter is
/// taken from `TRACERELAY_LOG`, then `RUST_LOG`, then `warn`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var("TRACERELAY_LOG")
            .ok()
            .and_then(|s| EnvFilter::try_new(s).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new("warn"));

        // Another harness may already have installed a global subscriber.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking after [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    with_timeout_of(TEST_TIMEOUT, f).await
}

pub async fn with_timeout_of<F, T>(limit: Duration, f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, f).await {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {limit:?}"),
    }
}
