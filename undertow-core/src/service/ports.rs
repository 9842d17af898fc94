//! Listen ports and their router mappings.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::backend::settings::build_listen_endpoints;
use crate::backend::{BtSession, ListenEndpoint, PortProtocol};
use crate::config::UndertowConfig;

/// A port mapping the session accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub id: i32,
    pub protocol: PortProtocol,
    pub port: u16,
}

/// Random listen endpoints inside the configured port range.
pub fn choose_endpoints(config: &UndertowConfig) -> Vec<ListenEndpoint> {
    let network = &config.network;
    let endpoints = build_listen_endpoints(
        &network.listen_interfaces,
        network.listen_port_min,
        network.listen_port_max,
        &mut rand::rng(),
    );
    debug!("Chose {} listen endpoint(s)", endpoints.len());
    endpoints
}

/// Maps every distinct endpoint port for TCP and UDP. Rejected mappings
/// are logged and left out.
pub fn map_ports(session: &dyn BtSession, endpoints: &[ListenEndpoint]) -> Vec<PortMapping> {
    let ports: BTreeSet<u16> = endpoints.iter().map(|endpoint| endpoint.port).collect();
    let mut mappings = Vec::with_capacity(ports.len() * 2);
    for port in ports {
        for protocol in [PortProtocol::Tcp, PortProtocol::Udp] {
            match session.add_port_mapping(protocol, port, port) {
                Ok(id) => mappings.push(PortMapping { id, protocol, port }),
                Err(e) => warn!("Mapping {:?} port {} failed: {}", protocol, port, e),
            }
        }
    }
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::SimulatedSession;

    #[test]
    fn test_endpoints_per_interface() {
        let mut config = UndertowConfig::default();
        config.network.listen_interfaces = vec!["10.0.0.1".to_string(), "::1".to_string()];
        config.network.listen_port_min = 6891;
        config.network.listen_port_max = 6899;
        let endpoints = choose_endpoints(&config);
        assert_eq!(endpoints.len(), 4);
        assert!(endpoints.iter().all(|e| (6891..=6899).contains(&e.port)));
        assert_eq!(endpoints[2].to_string(), format!("[::1]:{}", endpoints[2].port));
    }

    #[test]
    fn test_map_ports_skips_rejected() {
        let session = SimulatedSession::new();
        let endpoints = vec![
            ListenEndpoint {
                interface: "0.0.0.0".to_string(),
                port: 6891,
            },
            ListenEndpoint {
                interface: "10.0.0.1".to_string(),
                port: 6891,
            },
            ListenEndpoint {
                interface: "0.0.0.0".to_string(),
                port: 0,
            },
        ];
        let mappings = map_ports(&session, &endpoints);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].protocol, PortProtocol::Tcp);
        assert_eq!(mappings[1].protocol, PortProtocol::Udp);
        assert_eq!(session.port_mappings().len(), 2);
    }
}
