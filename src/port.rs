//! Port selection for endpoint groups.

use crate::error::PortError;
use crate::model::NamedPort;
use crate::target::PortSpec;

/// Selects the port number to use for a group's addresses.
///
/// A named port that the group does not list is an error, so that a group
/// never yields an address with a non-numeric port.
///
/// # Errors
///
/// Returns [`PortError::NoPorts`] when the first port is requested from an
/// empty list, and [`PortError::NamedPortNotFound`] when no port carries the
/// requested name.
pub fn resolve_port(ports: &[NamedPort], spec: &PortSpec) -> Result<u16, PortError> {
    match spec {
        PortSpec::First => ports.first().map(|p| p.number).ok_or(PortError::NoPorts),
        PortSpec::Name(name) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.number)
            .ok_or_else(|| PortError::NamedPortNotFound(name.clone())),
        PortSpec::Number(n) => Ok(*n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<NamedPort> {
        vec![
            NamedPort::new(Some("http"), 8080),
            NamedPort::new(Some("dns"), 53),
            NamedPort::new(None, 9100),
        ]
    }

    #[test]
    fn first_port() {
        assert_eq!(resolve_port(&ports(), &PortSpec::First), Ok(8080));
    }

    #[test]
    fn first_port_with_no_ports_fails() {
        assert_eq!(resolve_port(&[], &PortSpec::First), Err(PortError::NoPorts));
    }

    #[test]
    fn named_port() {
        assert_eq!(resolve_port(&ports(), &"dns".into()), Ok(53));
    }

    #[test]
    fn named_port_first_match_wins() {
        let ports = vec![
            NamedPort::new(Some("http"), 8080),
            NamedPort::new(Some("http"), 53),
        ];
        assert_eq!(resolve_port(&ports, &"http".into()), Ok(8080));
    }

    #[test]
    fn named_port_miss_fails() {
        assert_eq!(
            resolve_port(&ports(), &"grpc".into()),
            Err(PortError::NamedPortNotFound("grpc".to_string()))
        );
    }

    #[test]
    fn numeric_port_is_verbatim() {
        assert_eq!(resolve_port(&[], &PortSpec::Number(50051)), Ok(50051));
        assert_eq!(resolve_port(&ports(), &PortSpec::Number(53)), Ok(53));
    }

    #[test]
    fn resolution_is_deterministic() {
        let ports = ports();
        let spec = PortSpec::Name("http".to_string());
        let first = resolve_port(&ports, &spec);

        for _ in 0..10 {
            assert_eq!(resolve_port(&ports, &spec), first);
        }
    }
}
