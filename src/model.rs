//! Snapshot and event types shared by change sources and the resolver.

use std::net::SocketAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};

use crate::error::SourceError;

/// A named, numbered port shared by the addresses of an endpoint group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPort {
    /// Port name, if the service port is named.
    pub name: Option<String>,
    /// Port number.
    pub number: u16,
}

impl NamedPort {
    /// Creates a port entry.
    #[must_use]
    pub fn new(name: Option<&str>, number: u16) -> Self {
        Self {
            name: name.map(String::from),
            number,
        }
    }
}

/// One address of an endpoint group with its readiness flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupAddress {
    /// IP address as reported by the directory service.
    pub ip: String,
    /// Whether the address is ready to receive traffic.
    pub ready: bool,
    /// Whether the address is serving, regardless of termination state.
    pub serving: bool,
    /// Whether the address is terminating.
    pub terminating: bool,
}

impl GroupAddress {
    /// Creates a ready, serving address.
    #[must_use]
    pub fn ready(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ready: true,
            serving: true,
            terminating: false,
        }
    }

    /// Creates an address that is not ready.
    #[must_use]
    pub fn not_ready(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ready: false,
            serving: false,
            terminating: false,
        }
    }
}

/// A set of addresses sharing a list of ports.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointGroup {
    /// Member addresses.
    pub addresses: Vec<GroupAddress>,
    /// Ports shared by all members, in listed order.
    pub ports: Vec<NamedPort>,
}

impl From<&EndpointSubset> for EndpointGroup {
    fn from(subset: &EndpointSubset) -> Self {
        let ready = subset
            .addresses
            .iter()
            .flatten()
            .map(|a: &EndpointAddress| GroupAddress::ready(a.ip.clone()));

        let not_ready = subset
            .not_ready_addresses
            .iter()
            .flatten()
            .map(|a: &EndpointAddress| GroupAddress::not_ready(a.ip.clone()));

        let ports = subset
            .ports
            .iter()
            .flatten()
            .filter_map(|p| {
                let number = u16::try_from(p.port).ok();
                if number.is_none() {
                    tracing::warn!("ignoring out-of-range endpoint port {}", p.port);
                }

                number.map(|number| NamedPort::new(p.name.as_deref(), number))
            })
            .collect();

        Self {
            addresses: ready.chain(not_ready).collect(),
            ports,
        }
    }
}

/// The state of one resource at one resource version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Opaque version token issued by the directory service.
    pub resource_version: Option<String>,
    /// Endpoint groups, in the order the service listed them.
    pub groups: Vec<EndpointGroup>,
}

impl Snapshot {
    /// Creates an unversioned snapshot from groups.
    #[must_use]
    pub fn new(groups: Vec<EndpointGroup>) -> Self {
        Self {
            resource_version: None,
            groups,
        }
    }
}

impl From<&Endpoints> for Snapshot {
    fn from(endpoints: &Endpoints) -> Self {
        Self {
            resource_version: endpoints.metadata.resource_version.clone(),
            groups: endpoints
                .subsets
                .iter()
                .flatten()
                .map(EndpointGroup::from)
                .collect(),
        }
    }
}

/// A change to the watched resource, in resource-version order.
#[derive(Debug)]
pub enum ChangeEvent {
    /// The resource appeared, or a full state was (re)listed.
    Added(Snapshot),
    /// The resource changed; the snapshot replaces the previous one.
    Modified(Snapshot),
    /// The resource is proven to be gone.
    Deleted(Snapshot),
    /// The source hit a transport error.
    Error(SourceError),
}

/// A resolved socket address handed to the consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedAddress {
    /// Address to connect to.
    pub addr: SocketAddr,
    /// Server name for TLS verification, `service.namespace`.
    pub server_name: Arc<str>,
}
