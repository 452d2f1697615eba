//! # Kubernetes module
//!
//! This module provide the reconciliation machinery shared by every custom
//! resource handled by the operator

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, Instrument};

use crate::svc::{cfg::Configuration, k8s::store::Store, telemetry::gauge::Telemetry};

pub mod client;
pub mod finalizer;
#[cfg(test)]
pub mod memory;
pub mod resource;
pub mod store;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "dbaas_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'dbaas_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "dbaas_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'dbaas_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "dbaas_operator_reconciliation_event",
            "number of upsert or delete event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'dbaas_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "dbaas_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'dbaas_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// contains what every reconciler needs to interact with kubernetes and to
/// report its observations.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub config: Arc<Configuration>,
    pub telemetry: Arc<Telemetry>,
}

impl Context {
    pub fn new(store: Arc<dyn Store>, config: Arc<Configuration>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            store,
            config,
            telemetry,
        }
    }
}

// -----------------------------------------------------------------------------
// Outcome enumeration

/// Result of a reconciliation that went through, errors are the fatal branch
/// and are handled by [`Reconciler::retry`].
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Outcome {
    /// nothing left to do until the resource changes
    Done,
    /// look at the resource again right away, used after a write conflict
    RequeueNow,
    /// look at the resource again after the given delay, used while waiting
    /// on another resource
    RequeueAfter(Duration),
}

impl Outcome {
    pub fn action(&self) -> Action {
        match self {
            Self::Done => Action::await_change(),
            Self::RequeueNow => Action::requeue(Duration::ZERO),
            Self::RequeueAfter(delay) => Action::requeue(*delay),
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, client: kube::Client, config: &Configuration) -> Controller<T>;
}

/// returns the controller configuration shared by every kind
pub fn controller_config(config: &Configuration) -> controller::Config {
    controller::Config::default().concurrency(config.operator.concurrency)
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the methods given to a kubernetes controller [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync + 'static;

    /// create or update the object, this is part of the the reconcile function
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<Outcome, Self::Error>;

    /// release what the operator holds for the object before kubernetes
    /// removes it
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// returns a [`Action`] to perform following the given error
    fn retry(obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        let backoff = ctx.config.operator.backoff();

        trace!(
            kind = T::api_resource().kind,
            name = obj.name_any(),
            duration = backoff.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation",
        );

        Action::requeue(backoff)
    }

    /// dispatch the object to [`Reconciler::upsert`] or [`Reconciler::delete`]
    /// and translate the outcome into an [`Action`] for the controller
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();

        if resource::deleted(&*obj) {
            info!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                "Received deletion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            let result = Self::delete(ctx, obj.to_owned())
                .instrument(tracing::info_span!("Reconciler::delete"))
                .await;

            if let Err(err) = result {
                error!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to delete custom resource",
                );
                return Err(err);
            }

            return Ok(Action::await_change());
        }

        debug!(
            kind = &api_resource.kind,
            namespace = &namespace,
            name = &name,
            "Received upsertion event for custom resource",
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_UPSERT_EVENT])
            .inc();

        match Self::upsert(ctx, obj.to_owned())
            .instrument(tracing::info_span!("Reconciler::upsert"))
            .await
        {
            Ok(outcome) => {
                debug!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    outcome = ?outcome,
                    "Upserted custom resource",
                );
                Ok(outcome.action())
            }
            Err(err) => {
                error!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to upsert custom resource",
                );
                Err(err)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
{
    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, client: kube::Client, context: Arc<Context>) {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(client, &context.config)
            .run(Self::reconcile, Self::retry, context.to_owned())
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return;
                }
                Ok(Some((obj, _action))) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = &obj.namespace,
                        name = &obj.name,
                        "Successfully reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj_ref)) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = &obj_ref.namespace,
                        name = &obj_ref.name,
                        "Received an event about an already deleted resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanklet implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    Self: Send + Sync + 'static,
{
}
