//! Driver tunables, in the style of `cmd_util::env::env_config`: every
//! knob has a hardcoded default and can be overridden by an environment
//! variable at process startup, so operators can adjust behavior without a
//! redeploy.

use std::time::Duration;

use cmd_util::env::env_config;

/// `spec.md` §9's open question (a): whether FETCHING needs a timeout that
/// forces a repoll. We resolve it by exposing the timeout as a tunable
/// rather than guessing a threshold; `None` (the default) disables it,
/// matching the spec's literal behavior of never repolling on a timer.
#[derive(Clone, Copy, Debug)]
pub struct ObserveDriverConfig {
    /// Maximum number of point fetches to have in flight at once within a
    /// single fetch-loop batch.
    pub fetch_concurrency: usize,
    /// If set, `FETCHING` held for longer than this without draining
    /// `need_to_fetch` triggers a forced repoll. Unset by default: the base
    /// specification doesn't prescribe a threshold.
    pub fetching_timeout: Option<Duration>,
    /// Multiplier applied to `limit` when running the initial/poll query,
    /// so the buffer starts warm. The spec fixes this at 2; exposed here so
    /// operators can trade memory for fewer early repolls.
    pub poll_query_limit_multiplier: usize,
}

impl ObserveDriverConfig {
    pub fn from_env() -> Self {
        let fetching_timeout_ms: u64 = env_config("OPLOG_DRIVER_FETCHING_TIMEOUT_MS", 0);
        Self {
            fetch_concurrency: env_config("OPLOG_DRIVER_FETCH_CONCURRENCY", 16),
            fetching_timeout: (fetching_timeout_ms > 0)
                .then(|| Duration::from_millis(fetching_timeout_ms)),
            poll_query_limit_multiplier: env_config("OPLOG_DRIVER_POLL_LIMIT_MULTIPLIER", 2),
        }
    }
}

impl Default for ObserveDriverConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 16,
            fetching_timeout: None,
            poll_query_limit_multiplier: 2,
        }
    }
}
