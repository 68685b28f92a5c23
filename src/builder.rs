//! Builds resolvers from target strings.

use std::net::SocketAddr;
use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc::Sender;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::consumer::{AddressSink, BalanceChannel};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::resolver::{self, ResolverHandle, ResolverOptions};
use crate::source::{ChangeSource, ReflectorSource};
use crate::target::{DEFAULT_SCHEME, TargetDescriptor, current_namespace_or_default};

/// Creates one resolver per target, all sharing a change source and a
/// metrics registry.
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use tonic::transport::{Channel, Endpoint};
/// use tonic_kuberesolver::{BalanceChannel, ResolverBuilder};
///
/// let builder = ResolverBuilder::try_default().await?;
/// let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
///
/// let resolver = builder.build(
///     "kubernetes:///my-grpc-service.my-namespace:grpc",
///     BalanceChannel::new(tx, |addr| {
///         Endpoint::from_shared(format!("http://{addr}")).unwrap()
///     }),
/// )?;
/// ```
pub struct ResolverBuilder<S> {
    source: Arc<S>,
    scheme: String,
    namespace: String,
    options: ResolverOptions,
    metrics: Metrics,
}

impl ResolverBuilder<ReflectorSource> {
    /// Creates a builder that watches `Endpoints` with the default client.
    ///
    /// Targets without a namespace use the client's default namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if no in-cluster or kubeconfig client can be created.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        let namespace = client.default_namespace().to_string();

        Ok(Self::new(ReflectorSource::new(client)).with_namespace(namespace))
    }
}

impl<S: ChangeSource> ResolverBuilder<S> {
    /// Creates a builder for the `kubernetes` scheme.
    ///
    /// Targets without a namespace use the namespace of the current pod, or
    /// `default` outside a cluster.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            scheme: DEFAULT_SCHEME.to_string(),
            namespace: current_namespace_or_default(),
            options: ResolverOptions::default(),
            metrics: Metrics::new(),
        }
    }

    /// Handles targets of a custom scheme instead of `kubernetes`.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Sets the namespace for targets that do not name one.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the options every resolver is started with.
    #[must_use]
    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Shares an existing metrics registry.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The scheme this builder handles.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The registry holding every target's gauges.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Parses `target`, defaulting its namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the target string is malformed.
    pub fn parse_target(&self, target: &str) -> Result<TargetDescriptor> {
        let mut descriptor = TargetDescriptor::parse(target, &self.scheme)?;
        if descriptor.namespace.is_empty() {
            descriptor.namespace.clone_from(&self.namespace);
        }

        Ok(descriptor)
    }

    /// Starts resolving `target` and publishing its addresses to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the target string is malformed.
    pub fn build<C: AddressSink>(&self, target: &str, sink: C) -> Result<ResolverHandle> {
        let descriptor = self.parse_target(target)?;

        tracing::debug!("building Kubernetes resolver for {descriptor}");

        let handle = resolver::start(
            descriptor,
            Arc::clone(&self.source),
            sink,
            self.options.clone(),
            &self.metrics,
        )?;

        Ok(handle)
    }
}

/// Resolves `target` and feeds its endpoints to a tonic balance channel.
///
/// Creates a Kubernetes client from the environment, watches the target's
/// `Endpoints` and sends `Change` events to `tx`. The `build` function
/// creates the `Endpoint` for each discovered address.
///
/// # Requirements
///
/// - The application must have RBAC permissions to list and watch `Endpoints`
/// - Kubernetes client configuration (in-cluster or kubeconfig)
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use std::time::Duration;
/// use tonic::transport::{Channel, Endpoint};
/// use tonic_kuberesolver::discover;
///
/// let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
///
/// let resolver = discover("kubernetes:///my-grpc-service:50051", tx, |addr| {
///     Endpoint::from_shared(format!("http://{addr}"))
///         .unwrap()
///         .connect_timeout(Duration::from_secs(5))
/// })
/// .await?;
///
/// // Use with your generated gRPC client
/// let client = MyServiceClient::new(channel);
/// ```
///
/// # Errors
///
/// Returns an error if the target is malformed or no client can be created.
pub async fn discover<F>(
    target: &str,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Result<ResolverHandle>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    let builder = ResolverBuilder::try_default().await?;
    builder.build(target, BalanceChannel::new(tx, build))
}
