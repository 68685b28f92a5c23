//! Computes address-set deltas between snapshots.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::model::{ResolvedAddress, Snapshot};
use crate::port::resolve_port;
use crate::target::TargetDescriptor;

/// The resolver's current set of addresses, keyed by socket address.
pub type MaterializedSet = BTreeMap<SocketAddr, ResolvedAddress>;

/// The result of applying a snapshot to a materialized set.
#[derive(Debug, Default)]
pub struct Diff {
    /// Addresses present in `next` but not before.
    pub added: Vec<ResolvedAddress>,
    /// Addresses present before but not in `next`.
    pub removed: Vec<SocketAddr>,
    /// The materialized set described by the snapshot.
    pub next: MaterializedSet,
    /// Number of groups skipped because no port could be resolved.
    pub skipped_groups: usize,
}

impl Diff {
    /// Returns `true` if the snapshot changed the set of addresses.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Resolves a snapshot into a set of ready addresses.
///
/// Groups whose port cannot be resolved are skipped and counted; addresses
/// that are not ready or are not valid IPs are ignored.
#[must_use]
pub fn materialize(snapshot: &Snapshot, target: &TargetDescriptor) -> (MaterializedSet, usize) {
    let server_name: Arc<str> = target.server_name().into();
    let mut set = MaterializedSet::new();
    let mut skipped = 0;

    for group in &snapshot.groups {
        let port = match resolve_port(&group.ports, &target.port) {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!("skipping endpoint group for {target}: {e}");
                skipped += 1;
                continue;
            }
        };

        for address in group.addresses.iter().filter(|a| a.ready) {
            let Ok(ip) = address.ip.parse::<IpAddr>() else {
                tracing::warn!("ignoring invalid endpoint address {:?}", address.ip);
                continue;
            };

            let addr = SocketAddr::new(ip, port);
            set.insert(
                addr,
                ResolvedAddress {
                    addr,
                    server_name: Arc::clone(&server_name),
                },
            );
        }
    }

    (set, skipped)
}

/// Computes the delta between `previous` and the addresses described by
/// `snapshot`.
#[must_use]
pub fn diff(previous: &MaterializedSet, snapshot: &Snapshot, target: &TargetDescriptor) -> Diff {
    let (next, skipped_groups) = materialize(snapshot, target);

    let added = next
        .values()
        .filter(|a| !previous.contains_key(&a.addr))
        .cloned()
        .collect();

    let removed = previous
        .keys()
        .filter(|addr| !next.contains_key(addr))
        .copied()
        .collect();

    Diff {
        added,
        removed,
        next,
        skipped_groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointGroup, GroupAddress, NamedPort};
    use crate::target::PortSpec;

    fn target(port: PortSpec) -> TargetDescriptor {
        TargetDescriptor::new("service", "ns", port)
    }

    fn group(ips: &[&str], ports: Vec<NamedPort>) -> EndpointGroup {
        EndpointGroup {
            addresses: ips.iter().map(|ip| GroupAddress::ready(*ip)).collect(),
            ports,
        }
    }

    fn keys(set: &MaterializedSet) -> Vec<String> {
        set.keys().map(ToString::to_string).collect()
    }

    fn http_dns_ports() -> Vec<NamedPort> {
        vec![
            NamedPort::new(Some("http"), 8080),
            NamedPort::new(Some("dns"), 53),
        ]
    }

    #[test]
    fn explicit_port() {
        let snapshot = Snapshot::new(vec![group(
            &["1.1.1.1", "2.2.2.2"],
            vec![NamedPort::new(None, 8080)],
        )]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::Number(8080)));

        assert_eq!(keys(&d.next), ["1.1.1.1:8080", "2.2.2.2:8080"]);
        assert_eq!(d.added.len(), 2);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn implicit_port_uses_first() {
        let ports = vec![
            NamedPort::new(Some("http"), 8080),
            NamedPort::new(Some("http"), 53),
        ];
        let snapshot = Snapshot::new(vec![group(&["1.1.1.1", "2.2.2.2"], ports)]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::First));

        assert_eq!(keys(&d.next), ["1.1.1.1:8080", "2.2.2.2:8080"]);
    }

    #[test]
    fn named_port() {
        let snapshot = Snapshot::new(vec![group(&["1.1.1.1"], http_dns_ports())]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target("dns".into()));

        assert_eq!(keys(&d.next), ["1.1.1.1:53"]);
    }

    #[test]
    fn named_port_miss_skips_only_that_group() {
        let snapshot = Snapshot::new(vec![
            group(&["1.1.1.1"], vec![NamedPort::new(Some("http"), 8080)]),
            group(&["2.2.2.2"], http_dns_ports()),
        ]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target("dns".into()));

        assert_eq!(keys(&d.next), ["2.2.2.2:53"]);
        assert_eq!(d.skipped_groups, 1);
    }

    #[test]
    fn skips_not_ready_and_invalid_addresses() {
        let snapshot = Snapshot::new(vec![EndpointGroup {
            addresses: vec![
                GroupAddress::ready("1.1.1.1"),
                GroupAddress::not_ready("3.3.3.3"),
                GroupAddress::ready("not-an-ip"),
            ],
            ports: http_dns_ports(),
        }]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::First));

        assert_eq!(keys(&d.next), ["1.1.1.1:8080"]);
    }

    #[test]
    fn ipv6_addresses() {
        let snapshot = Snapshot::new(vec![group(&["::1", "2001:db8::1"], http_dns_ports())]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::First));

        assert!(d.next.contains_key(&"[::1]:8080".parse().unwrap()));
        assert!(d.next.contains_key(&"[2001:db8::1]:8080".parse().unwrap()));
    }

    #[test]
    fn deduplicates_addresses_across_groups() {
        let snapshot = Snapshot::new(vec![
            group(&["1.1.1.1"], http_dns_ports()),
            group(&["1.1.1.1"], http_dns_ports()),
        ]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::First));

        assert_eq!(d.next.len(), 1);
        assert_eq!(d.added.len(), 1);
    }

    #[test]
    fn attaches_server_name() {
        let snapshot = Snapshot::new(vec![group(&["1.1.1.1"], http_dns_ports())]);

        let d = diff(&MaterializedSet::new(), &snapshot, &target(PortSpec::First));

        assert_eq!(&*d.added[0].server_name, "service.ns");
    }

    #[test]
    fn reports_added_and_removed() {
        let t = target(PortSpec::First);
        let before = Snapshot::new(vec![group(&["1.1.1.1", "2.2.2.2"], http_dns_ports())]);
        let after = Snapshot::new(vec![group(&["2.2.2.2", "3.3.3.3"], http_dns_ports())]);

        let first = diff(&MaterializedSet::new(), &before, &t);
        let second = diff(&first.next, &after, &t);

        let added: Vec<_> = second.added.iter().map(|a| a.addr.to_string()).collect();
        assert_eq!(added, ["3.3.3.3:8080"]);
        assert_eq!(second.removed, ["1.1.1.1:8080".parse::<SocketAddr>().unwrap()]);
        assert!(second.is_changed());
    }

    #[test]
    fn same_snapshot_twice_is_unchanged() {
        let t = target(PortSpec::First);
        let snapshot = Snapshot::new(vec![group(&["1.1.1.1", "2.2.2.2"], http_dns_ports())]);

        let first = diff(&MaterializedSet::new(), &snapshot, &t);
        let second = diff(&first.next, &snapshot, &t);

        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert!(!second.is_changed());
        assert_eq!(first.next, second.next);
    }

    #[test]
    fn empty_snapshot_removes_everything() {
        let t = target(PortSpec::First);
        let snapshot = Snapshot::new(vec![group(&["1.1.1.1", "2.2.2.2"], http_dns_ports())]);

        let first = diff(&MaterializedSet::new(), &snapshot, &t);
        let second = diff(&first.next, &Snapshot::default(), &t);

        assert!(second.next.is_empty());
        assert_eq!(second.removed.len(), 2);
    }

    #[test]
    fn result_is_independent_of_group_order() {
        let t = target(PortSpec::First);
        let a = group(&["1.1.1.1", "2.2.2.2"], http_dns_ports());
        let b = group(&["3.3.3.3"], vec![NamedPort::new(None, 9090)]);

        let forward = diff(
            &MaterializedSet::new(),
            &Snapshot::new(vec![a.clone(), b.clone()]),
            &t,
        );
        let backward = diff(&MaterializedSet::new(), &Snapshot::new(vec![b, a]), &t);

        assert_eq!(forward.next, backward.next);
    }

    #[test]
    fn incremental_updates_converge_to_cold_snapshot() {
        let t = target(PortSpec::First);
        let steps = [
            Snapshot::new(vec![group(&["1.1.1.1"], http_dns_ports())]),
            Snapshot::new(vec![group(&["1.1.1.1", "2.2.2.2"], http_dns_ports())]),
            Snapshot::default(),
            Snapshot::new(vec![group(&["2.2.2.2", "4.4.4.4"], http_dns_ports())]),
        ];

        let mut set = MaterializedSet::new();
        for step in &steps {
            set = diff(&set, step, &t).next;
        }

        let cold = diff(&MaterializedSet::new(), &steps[3], &t).next;
        assert_eq!(set, cold);
    }
}
