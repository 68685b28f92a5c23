#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes name resolution for [Tonic](https://docs.rs/tonic) gRPC load balancing.
//!
//! When using gRPC (HTTP/2) with Kubernetes, standard `ClusterIP` services don't load balance
//! effectively because HTTP/2 multiplexes all requests over a single long-lived TCP connection.
//! This crate resolves a target such as `kubernetes:///my-service.my-namespace:grpc` into the
//! ready pod addresses behind the service, keeps that list current by watching the service's
//! `Endpoints` object, and hands every change to a consumer such as a Tonic balance channel.
//!
//! # Features
//!
//! - **Target strings**: `kubernetes://[namespace/]service[.namespace][:port|:portName]`
//! - **Single-object watch**: each target watches exactly one `Endpoints` object
//! - **Full-list updates**: consumers always receive the complete current address list
//! - **Resilient**: resubscribes with jittered backoff and keeps the last known addresses
//!   across transient outages
//! - **Observability**: per-target gauges for endpoint groups and resolved addresses
//!
//! # Usage
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_kuberesolver::discover;
//!
//! // Create your own balance channel
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! // Start resolution - build function returns Endpoint for each address
//! let resolver = discover("kubernetes:///my-grpc-service:50051", tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })
//! .await?;
//!
//! // Use with your generated gRPC client
//! // let client = MyServiceClient::new(channel);
//!
//! // Stop watching when done
//! resolver.close().await;
//! ```

mod backoff;
mod builder;
mod consumer;
mod diff;
mod error;
mod metrics;
mod model;
mod port;
mod resolver;
pub mod source;
mod target;

pub use backoff::BackoffConfig;
pub use builder::{ResolverBuilder, discover};
pub use consumer::{AddressSink, BalanceChannel, ConsumerClosed};
pub use diff::{Diff, MaterializedSet, diff, materialize};
pub use error::{Error, PortError, Result, SourceError, TargetError};
pub use metrics::{Gauge, Metrics, TargetGauges, TargetSample};
pub use model::{ChangeEvent, EndpointGroup, GroupAddress, NamedPort, ResolvedAddress, Snapshot};
pub use port::resolve_port;
pub use resolver::{
    DeletePolicy, ResolverHandle, ResolverOptions, ResolverState, start as start_resolver,
};
pub use target::{
    DEFAULT_NAMESPACE, DEFAULT_SCHEME, NAMESPACE_FILE, PortSpec, ResourceKey, TargetDescriptor,
    current_namespace_or_default,
};
