use std::collections::HashMap;
use std::time::Duration;

/// A flat bundle of per-node measurements and gate decisions, keyed `"{node_name}.{suffix}"`.
pub type Metrics = HashMap<String, String>;

pub(crate) fn format_secs(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}
