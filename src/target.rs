//! Target descriptors and target string parsing.
//!
//! A target has the form `scheme://[namespace/]service[.namespace][:port]`.
//! The following spellings are all accepted:
//!
//! - `kubernetes:///service.namespace:port`
//! - `kubernetes://namespace/service:port`
//! - `kubernetes://service.namespace:port`
//!
//! Fully-qualified names such as `service.namespace.svc.cluster.local` are
//! reduced to their service and namespace. An absent port selects the first
//! listed port of each endpoint group; a non-numeric port is looked up by name.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::TargetError;

/// Scheme handled by default.
pub const DEFAULT_SCHEME: &str = "kubernetes";

/// File holding the namespace of the pod this process runs in.
pub const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace used when [`NAMESPACE_FILE`] cannot be read.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Port specification for the target service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortSpec {
    /// Use the first port listed by each endpoint group.
    First,
    /// A numeric port number, used verbatim.
    Number(u16),
    /// A named port, resolved per endpoint group.
    Name(String),
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for PortSpec {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for PortSpec {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl PortSpec {
    /// Parses the port segment of a target.
    fn parse(port: &str) -> Result<Self, TargetError> {
        if port.is_empty() {
            return Ok(Self::First);
        }

        if port.bytes().all(|b| b.is_ascii_digit()) {
            return port
                .parse()
                .map(Self::Number)
                .map_err(|_| TargetError::InvalidPort(port.to_string()));
        }

        Ok(Self::Name(port.to_string()))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => Ok(()),
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A validated resolution target.
///
/// Created once when resolution starts and owned by its resolver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// The scheme the target was written with.
    pub scheme: String,

    /// The Kubernetes service name to resolve.
    pub service_name: String,

    /// The namespace of the service. Empty until defaulted by the builder
    /// when the target did not name one.
    pub namespace: String,

    /// How to pick a port for each endpoint group.
    pub port: PortSpec,
}

impl TargetDescriptor {
    /// Creates a `kubernetes` descriptor for a service in an explicit
    /// namespace.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        namespace: impl Into<String>,
        port: impl Into<PortSpec>,
    ) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            service_name: service_name.into(),
            namespace: namespace.into(),
            port: port.into(),
        }
    }

    /// Replaces the scheme.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Parses a target string of the given scheme.
    ///
    /// # Errors
    ///
    /// Returns a [`TargetError`] when the string is not of the form
    /// `scheme://[namespace/]service[.namespace][:port]`, names no service,
    /// or carries an out-of-range numeric port.
    pub fn parse(target: &str, scheme: &str) -> Result<Self, TargetError> {
        let Some((found, rest)) = target.split_once("://") else {
            return Err(TargetError::MissingScheme(target.to_string()));
        };

        if found != scheme {
            return Err(TargetError::SchemeMismatch {
                expected: scheme.to_string(),
                found: found.to_string(),
            });
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let path = path.trim_matches('/');

        let (service, port, namespace) = if authority.is_empty() {
            // kubernetes:///service.namespace:port
            split_service_port_namespace(path)
        } else if !authority.contains(':') && !path.is_empty() {
            // kubernetes://namespace/service:port
            let (service, port, _) = split_service_port_namespace(path);
            (service, port, authority)
        } else {
            // kubernetes://service.namespace:port
            split_service_port_namespace(authority)
        };

        if service.is_empty() {
            return Err(TargetError::MissingService(target.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            service_name: service.to_string(),
            namespace: namespace.to_string(),
            port: PortSpec::parse(port)?,
        })
    }

    /// Returns the key of the resource this target watches.
    #[must_use]
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace.clone(),
            name: self.service_name.clone(),
        }
    }

    /// Returns the server name attached to every resolved address.
    #[must_use]
    pub fn server_name(&self) -> String {
        format!("{}.{}", self.service_name, self.namespace)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}:{}",
            self.scheme, self.namespace, self.service_name, self.port
        )
    }
}

/// Identifies exactly one named resource in one namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Namespace of the resource.
    pub namespace: String,
    /// Name of the resource.
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Splits `service[.namespace[.rest]][:port]` into its components.
fn split_service_port_namespace(hpn: &str) -> (&str, &str, &str) {
    let (service, port) = hpn.rsplit_once(':').unwrap_or((hpn, ""));

    let mut parts = service.splitn(3, '.');
    let service = parts.next().unwrap_or_default();
    let namespace = parts.next().unwrap_or_default();

    (service, port, namespace)
}

/// Reads the namespace of the current pod, falling back to `default`.
#[must_use]
pub fn current_namespace_or_default() -> String {
    namespace_from_file(Path::new(NAMESPACE_FILE))
}

fn namespace_from_file(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}
