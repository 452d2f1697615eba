//! # Telemetry module
//!
//! This module holds the gauges of delegated resources and the http server
//! which exposes them next to the health endpoint

use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{debug, error, info};

pub mod gauge;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod reason;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "dbaas_operator_server_request",
            "number of request handled by the server",
        ),
        &["path", "status"]
    )
    .expect("metrics 'dbaas_operator_server_request' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to bind server on '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve http requests, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

pub async fn router(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(status(StatusCode::NO_CONTENT)),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler(&req).await.map_err(Error::Metrics),
        _ => Ok(status(StatusCode::NOT_FOUND)),
    };

    let res = result.unwrap_or_else(|err| {
        error!(path = req.uri().path(), error = err.to_string(), "Could not handle request");
        status(StatusCode::INTERNAL_SERVER_ERROR)
    });

    debug!(
        method = req.method().as_str(),
        path = req.uri().path(),
        status = res.status().as_u16(),
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    SERVER_REQUEST
        .with_label_values(&[req.uri().path(), &res.status().as_u16().to_string()])
        .inc();

    Ok(res)
}

fn status(code: StatusCode) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = code;
    res
}

/// serve the health and metrics endpoints until the process stops
pub async fn serve(listen: SocketAddr) -> Result<(), Error> {
    let server = Server::try_bind(&listen)
        .map_err(|err| Error::Bind(listen, err))?
        .serve(make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(router))
        }));

    info!(listen = listen.to_string(), "Start to listen for http requests");
    server.await.map_err(Error::Serve)
}
