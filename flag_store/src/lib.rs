#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be
// copied and pasted across crates, but there doesn't appear to be a way to include inner
// attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings.
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

const FEATURE_FLAG_PREFIX: &str = "feature_flag_";
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
const REFRESH_INTERVAL_ENV_VAR: &str = "FLAG_STORE_REFRESH_INTERVAL_SECS";

///
/// A process-wide, concurrently-readable mapping of feature flag name to boolean, sourced from
/// the environment and refreshed on a fixed interval.
///
/// Flags are discovered from any environment variable whose name, lowercased, begins with
/// `feature_flag_`; the remainder of the name (also lowercased) becomes the flag name. Refreshing
/// only ever adds or overwrites entries: a flag whose environment variable has since been unset
/// remains at its last known value.
///
#[derive(Clone, Default)]
pub struct FlagStore {
    flags: Arc<Mutex<HashMap<String, bool>>>,
}

impl FlagStore {
    pub fn new() -> FlagStore {
        FlagStore {
            flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    ///
    /// Launches a background task that refreshes this store from the environment immediately,
    /// and then on every tick of the configured interval thereafter. The returned JoinHandle may
    /// be used by an embedder to cancel the refresher; dropping it does not stop the task.
    ///
    pub fn start(&self, executor: &task_executor::Executor) -> JoinHandle<()> {
        let store = self.clone();
        let interval = refresh_interval();
        executor.native_spawn(async move {
            loop {
                store.refresh_from_env();
                tokio::time::sleep(interval).await;
            }
        })
    }

    ///
    /// Returns whether the named flag is currently enabled. Absent flags are treated as disabled.
    ///
    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.lock().get(name).copied().unwrap_or(false)
    }

    fn refresh_from_env(&self) {
        let mut updates = HashMap::new();
        for (key, value) in env::vars() {
            let lowered = key.to_lowercase();
            let Some(flag_name) = lowered.strip_prefix(FEATURE_FLAG_PREFIX) else {
                continue;
            };
            updates.insert(flag_name.to_string(), parse_flag_value(&value));
        }

        log::debug!("refreshing {} feature flag(s) from the environment", updates.len());
        let mut flags = self.flags.lock();
        flags.extend(updates);
    }
}

fn parse_flag_value(value: &str) -> bool {
    match value.to_lowercase().as_str() {
        "true" | "1" => true,
        _ => false,
    }
}

fn refresh_interval() -> Duration {
    let secs = env::var(REFRESH_INTERVAL_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    Duration::from_secs(secs)
}
