//! # Reason module
//!
//! This module keeps track of the condition reasons observed for each
//! provider, so that gauges of stale reasons can be reset when the reason of a
//! resource changes.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

// -----------------------------------------------------------------------------
// ReasonCache structure

#[derive(Default, Debug)]
struct Inner {
    /// reasons ever observed per provider
    reasons: BTreeMap<String, BTreeSet<String>>,
    /// providers under which a resource, identified by its namespace and
    /// name, has been reported
    providers: BTreeMap<(String, String), BTreeSet<String>>,
}

#[derive(Default, Debug)]
pub struct ReasonCache {
    inner: Mutex<Inner>,
}

impl ReasonCache {
    /// remember the reason for the provider and the resource, returns the other
    /// reasons already observed for that provider
    pub fn record(&self, provider: &str, namespace: &str, name: &str, reason: &str) -> Vec<String> {
        let mut inner = self.inner.lock();

        inner
            .providers
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(provider.to_string());

        let reasons = inner.reasons.entry(provider.to_string()).or_default();
        reasons.insert(reason.to_string());

        reasons
            .iter()
            .filter(|r| r.as_str() != reason)
            .cloned()
            .collect()
    }

    /// forget the resource, returns each provider it was reported under along
    /// with the reasons known for that provider
    pub fn clear(&self, namespace: &str, name: &str) -> Vec<(String, Vec<String>)> {
        let mut inner = self.inner.lock();
        let providers = inner
            .providers
            .remove(&(namespace.to_string(), name.to_string()))
            .unwrap_or_default();

        providers
            .into_iter()
            .map(|provider| {
                let reasons = inner
                    .reasons
                    .get(&provider)
                    .map(|reasons| reasons.iter().cloned().collect())
                    .unwrap_or_default();

                (provider, reasons)
            })
            .collect()
    }
}
