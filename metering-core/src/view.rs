//! Deterministic names for aggregation views and the events table they read.

use crate::statement::{sanitize, Identifier};

/// Prefix shared by every table and view the service owns.
pub const TABLE_PREFIX: &str = "rc_";
/// Suffix marking a meter's materialized view.
pub const VIEW_SUFFIX: &str = "_mv";
/// Raw events table every meter view selects from.
pub const EVENTS_TABLE: &str = "rc_events";

/// Name of the view backing `meter_slug` for `tenant_slug`.
///
/// Always a valid identifier, whatever the slugs contain.
pub fn meter_view_name(tenant_slug: &str, meter_slug: &str) -> Identifier {
    Identifier::sanitized(&format!(
        "{}{}_{}{}",
        TABLE_PREFIX,
        sanitize(tenant_slug),
        sanitize(meter_slug),
        VIEW_SUFFIX
    ))
}

pub fn events_table() -> Identifier {
    Identifier::sanitized(EVENTS_TABLE)
}
