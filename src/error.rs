//! Error types for target parsing, port resolution and change sources.

use thiserror::Error;

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error returned when building a resolver.
#[derive(Debug, Error)]
pub enum Error {
    /// The target string could not be parsed.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// The Kubernetes client could not be created.
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),
}

/// Errors produced while parsing a target string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    /// The target has no `scheme://` prefix.
    #[error("target {0:?} must be of the form scheme://[namespace/]service[.namespace][:port]")]
    MissingScheme(String),

    /// The target uses a scheme other than the one this builder handles.
    #[error("target scheme {found:?} does not match {expected:?}")]
    SchemeMismatch {
        /// Scheme the builder was registered with.
        expected: String,
        /// Scheme found in the target.
        found: String,
    },

    /// The target does not name a service.
    #[error("target {0:?} must specify a service")]
    MissingService(String),

    /// The target has no namespace and none was defaulted.
    #[error("target {0:?} must specify a namespace")]
    MissingNamespace(String),

    /// The port is numeric but out of range.
    #[error("target port {0:?} is not a valid port number")]
    InvalidPort(String),
}

/// Errors produced when a port cannot be selected for an endpoint group.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// The group lists no ports at all.
    #[error("endpoint group has no ports")]
    NoPorts,

    /// No port in the group carries the requested name.
    #[error("no port named {0:?} in endpoint group")]
    NamedPortNotFound(String),
}

/// Transport-level failures reported by a change source.
///
/// These never reach the consumer; the resolver logs them and recovers by
/// resubscribing.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The Kubernetes client failed to issue the request.
    #[error("Kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),

    /// The watch request could not be built.
    #[error("invalid watch request: {0}")]
    Request(#[from] kube::core::request::Error),

    /// The reflector's watch stream reported an error.
    #[error("watch failed: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// Reading from the response body failed.
    #[error("watch stream read failed: {0}")]
    Io(#[from] std::io::Error),

    /// A watch event could not be decoded.
    #[error("unable to decode an event from the watch stream: {0}")]
    Decode(#[from] serde_json::Error),

    /// The response body ended in the middle of an event.
    #[error("unexpected EOF during watch stream event decoding")]
    UnexpectedEof,

    /// The server sent an `ERROR` watch event.
    #[error("watch returned status {code:?}: {message}")]
    Status {
        /// HTTP-style status code, when present.
        code: Option<i32>,
        /// Human-readable status message.
        message: String,
    },
}
