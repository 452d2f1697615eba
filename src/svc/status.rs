//! # Status module
//!
//! This module derives the `Ready` condition of logical resources from the
//! synchronisation condition reported by providers, and folds provider
//! status into logical status.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

// -----------------------------------------------------------------------------
// Constants

pub const READY: &str = "Ready";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

pub const REASON_READY: &str = "Ready";
pub const REASON_IN_PROGRESS: &str = "ProviderReconcileInProgress";
pub const REASON_INVALID_NAMESPACE: &str = "InvalidNamespace";
pub const REASON_INVENTORY_NOT_FOUND: &str = "DBaaSInventoryNotFound";
pub const REASON_INVENTORY_NOT_READY: &str = "DBaaSInventoryNotReady";
pub const REASON_PROVIDER_NOT_FOUND: &str = "DBaaSProviderNotFound";
pub const REASON_INSTANCE_NOT_FOUND: &str = "DBaaSInstanceNotFound";
pub const REASON_INSTANCE_NOT_AVAILABLE: &str = "DBaaSInstanceNotAvailable";
pub const REASON_CONFIGURATION: &str = "ConfigurationError";
pub const REASON_PROVIDER_WRITE: &str = "ProviderWriteError";
pub const REASON_PROVIDER_PARSING: &str = "ProviderParsingError";

pub const MESSAGE_SYNC_DONE: &str = "Provider resource status sync completed";
pub const MESSAGE_IN_PROGRESS: &str = "Waiting for the provider to reconcile its resource";

// -----------------------------------------------------------------------------
// Statused trait

/// Logical resource whose status is a copy of the status of a provider
/// resource, plus the `Ready` condition computed by the operator.
pub trait Statused {
    /// shape of the status reported by the provider
    type Status;

    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// conditions carried by a provider status
    fn provider_conditions(status: &Self::Status) -> &[Condition];

    /// replace the whole status with the one reported by the provider
    fn replace_status(&mut self, status: Self::Status);
}

// -----------------------------------------------------------------------------
// Helpers

pub fn now() -> Time {
    Time(Utc::now())
}

/// returns the condition of the given type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

/// returns if the condition of the given type is present and true
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_)
        .map(|condition| condition.status == STATUS_TRUE)
        .unwrap_or(false)
}

/// returns a `Ready` condition, its transition time is decided by [`set`]
pub fn ready(status: bool, reason: &str, message: &str, generation: Option<i64>) -> Condition {
    Condition {
        type_: READY.to_string(),
        status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Time(chrono::DateTime::<Utc>::MIN_UTC),
    }
}

/// insert or update the condition of the same type. The transition time only
/// moves when the status flips, reason and message are always refreshed.
pub fn set(conditions: &mut Vec<Condition>, condition: Condition, now: Time) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        None => conditions.push(Condition {
            last_transition_time: now,
            ..condition
        }),
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = now;
            }

            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
    }
}

/// returns the `Ready` condition matching the provider synchronisation
/// condition found in the given conditions
pub fn derive_ready(provider: &[Condition], sync: &str, generation: Option<i64>) -> Condition {
    if is_true(provider, sync) {
        ready(true, REASON_READY, MESSAGE_SYNC_DONE, generation)
    } else {
        ready(false, REASON_IN_PROGRESS, MESSAGE_IN_PROGRESS, generation)
    }
}

/// fold the provider status into the logical resource: the status is
/// replaced, then the previous `Ready` condition is carried over and updated
/// from the provider synchronisation condition
pub fn merge<T>(obj: &mut T, status: T::Status, sync: &str, generation: Option<i64>, now: Time)
where
    T: Statused,
{
    let condition = derive_ready(T::provider_conditions(&status), sync, generation);
    let previous = find(obj.conditions(), READY).cloned();

    obj.replace_status(status);

    let conditions = obj.conditions_mut();
    conditions.retain(|c| c.type_ != READY);
    conditions.extend(previous);

    set(conditions, condition, now);
}
