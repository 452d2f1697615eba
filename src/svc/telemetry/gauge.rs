//! # Gauge module
//!
//! This module exposes the readiness of logical resources as prometheus
//! gauges, one family set per kind.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use prometheus::{opts, GaugeVec, Registry};
use tracing::trace;

use crate::svc::{status, telemetry::reason::ReasonCache};

// -----------------------------------------------------------------------------
// Constants

const LABELS: [&str; 3] = ["provider", "resource", "namespace"];
const REASON_LABELS: [&str; 4] = ["provider", "resource", "namespace", "reason"];

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create metrics '{0}', {1}")]
    Create(String, prometheus::Error),
    #[error("failed to register metrics '{0}', {1}")]
    Register(String, prometheus::Error),
}

// -----------------------------------------------------------------------------
// Labels structure

/// identifies the series of a resource
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Labels<'a> {
    pub provider: &'a str,
    pub resource: &'a str,
    pub namespace: &'a str,
}

impl<'a> Labels<'a> {
    fn values(&self) -> [&'a str; 3] {
        [self.provider, self.resource, self.namespace]
    }

    fn with_reason<'b>(&self, reason: &'b str) -> [&'b str; 4]
    where
        'a: 'b,
    {
        [self.provider, self.resource, self.namespace, reason]
    }
}

// -----------------------------------------------------------------------------
// Metrics structure

pub struct Metrics {
    ready: GaugeVec,
    elapsed: GaugeVec,
    reason: GaugeVec,
    reasons: ReasonCache,
}

fn gauge(registry: &Registry, name: String, help: &str, labels: &[&str]) -> Result<GaugeVec, Error> {
    let gauge = GaugeVec::new(opts!(name.to_owned(), help), labels)
        .map_err(|err| Error::Create(name.to_owned(), err))?;

    registry
        .register(Box::new(gauge.to_owned()))
        .map_err(|err| Error::Register(name, err))?;

    Ok(gauge)
}

impl Metrics {
    /// create and register the gauges `dbaas_<kind>_status_ready`,
    /// `dbaas_<kind>_elapsed_time_seconds` and `dbaas_<kind>_status_reason`
    pub fn try_new(kind: &str, registry: &Registry) -> Result<Self, Error> {
        Ok(Self {
            ready: gauge(
                registry,
                format!("dbaas_{}_status_ready", kind),
                "whether the resource is ready, 1 if so, 0 otherwise",
                &LABELS,
            )?,
            elapsed: gauge(
                registry,
                format!("dbaas_{}_elapsed_time_seconds", kind),
                "seconds between the creation of the resource and its readiness",
                &LABELS,
            )?,
            reason: gauge(
                registry,
                format!("dbaas_{}_status_reason", kind),
                "reason of the readiness of the resource, 1 for the current one",
                &REASON_LABELS,
            )?,
            reasons: ReasonCache::default(),
        })
    }

    /// set the readiness gauge, the elapsed time is only meaningful once the
    /// resource is ready and its series is removed otherwise
    pub fn set_ready(&self, labels: &Labels, ready: bool, elapsed: Option<f64>) {
        self.ready
            .with_label_values(&labels.values())
            .set(if ready { 1.0 } else { 0.0 });

        match elapsed.filter(|_| ready) {
            Some(seconds) => self.elapsed.with_label_values(&labels.values()).set(seconds),
            None => {
                let _ = self.elapsed.remove_label_values(&labels.values());
            }
        }
    }

    /// set the gauge of the current reason to 1 and the ones of every other
    /// reason seen for the provider to 0
    pub fn set_reason(&self, labels: &Labels, reason: &str) {
        let stale = self
            .reasons
            .record(labels.provider, labels.namespace, labels.resource, reason);

        for other in &stale {
            self.reason.with_label_values(&labels.with_reason(other)).set(0.0);
        }

        self.reason.with_label_values(&labels.with_reason(reason)).set(1.0);
    }

    /// report the readiness of a resource from the given condition
    pub fn observe(&self, labels: &Labels, condition: Option<&Condition>, created: Option<&Time>) {
        let condition = match condition {
            Some(condition) => condition,
            None => {
                trace!(
                    provider = labels.provider,
                    namespace = labels.namespace,
                    name = labels.resource,
                    "skip metrics, resource does not report readiness yet",
                );
                return;
            }
        };

        let ready = condition.status == status::STATUS_TRUE;
        let elapsed = created.map(|created| {
            (condition.last_transition_time.0 - created.0).num_milliseconds() as f64 / 1000.0
        });

        self.set_ready(labels, ready, elapsed);
        self.set_reason(labels, &condition.reason);
    }

    /// remove every series of the resource
    pub fn clear(&self, namespace: &str, resource: &str) {
        for (provider, reasons) in self.reasons.clear(namespace, resource) {
            let labels = Labels {
                provider: &provider,
                resource,
                namespace,
            };

            let _ = self.ready.remove_label_values(&labels.values());
            let _ = self.elapsed.remove_label_values(&labels.values());
            for reason in &reasons {
                let _ = self.reason.remove_label_values(&labels.with_reason(reason));
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Telemetry structure

/// gauges of every logical kind
pub struct Telemetry {
    pub inventory: Metrics,
    pub instance: Metrics,
    pub connection: Metrics,
}

impl Telemetry {
    pub fn try_new(registry: &Registry) -> Result<Self, Error> {
        Ok(Self {
            inventory: Metrics::try_new("inventory", registry)?,
            instance: Metrics::try_new("instance", registry)?,
            connection: Metrics::try_new("connection", registry)?,
        })
    }
}
