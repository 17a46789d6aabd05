//! Tracing spans for the store's hot paths.
//!
//! Helpers only; the store works identically with no subscriber installed.

use tracing::{info_span, Span};

use crate::key::TriggerKey;

/// Span covering one `acquire_next_triggers` call.
#[must_use]
pub fn acquire_span(instance_id: impl AsRef<str>, max_count: usize) -> Span {
    info_span!(
        "quarry.acquire",
        instance_id = %instance_id.as_ref(),
        max_count,
    )
}

/// Span covering the fire of a single trigger.
#[must_use]
pub fn fire_span(key: &TriggerKey) -> Span {
    info_span!(
        "quarry.fire",
        trigger_group = %key.group,
        trigger_name = %key.name,
    )
}

/// Span covering one completion report, including its retries.
#[must_use]
pub fn complete_span(key: &TriggerKey, instruction: impl AsRef<str>) -> Span {
    info_span!(
        "quarry.complete",
        trigger_group = %key.group,
        trigger_name = %key.name,
        instruction = %instruction.as_ref(),
    )
}

/// Span covering one cluster check-in pass.
#[must_use]
pub fn cluster_span(instance_id: impl AsRef<str>) -> Span {
    info_span!(
        "quarry.cluster_checkin",
        instance_id = %instance_id.as_ref(),
    )
}
