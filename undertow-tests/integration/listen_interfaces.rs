//! Listen endpoints, the session setting and router mappings.

use std::collections::BTreeSet;

use undertow_core::backend::PortProtocol;
use undertow_core::service::testing::TestService;

fn two_interfaces() -> TestService {
    TestService::new(|config| {
        config.network.listen_interfaces = vec!["192.168.1.20".to_string(), "10.8.0.2".to_string()];
        config.network.listen_port_min = 6891;
        config.network.listen_port_max = 6899;
    })
}

#[tokio::test]
async fn test_two_ports_per_interface() {
    let test = two_interfaces();
    let endpoints = test.service.endpoints();
    assert_eq!(endpoints.len(), 4);
    for interface in ["192.168.1.20", "10.8.0.2"] {
        let ports: Vec<u16> = endpoints
            .iter()
            .filter(|endpoint| endpoint.interface == interface)
            .map(|endpoint| endpoint.port)
            .collect();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
        assert!(ports.iter().all(|port| (6891..=6899).contains(port)));
    }

    let settings = test.session.settings();
    let value = settings.get_str("listen_interfaces").unwrap();
    let entries: Vec<&str> = value.split(',').collect();
    assert_eq!(entries.len(), 4);
    for endpoint in endpoints {
        assert!(entries.contains(&endpoint.to_string().as_str()));
    }
}

#[tokio::test]
async fn test_every_port_mapped_for_both_protocols() {
    let test = two_interfaces();
    let ports: BTreeSet<u16> = test.service.endpoints().iter().map(|e| e.port).collect();
    let records = test.session.port_mappings();

    for protocol in [PortProtocol::Tcp, PortProtocol::Udp] {
        let mapped: BTreeSet<u16> = records
            .iter()
            .filter(|record| record.protocol == protocol)
            .map(|record| record.local_port)
            .collect();
        assert_eq!(mapped, ports, "{protocol:?}");
    }
    assert!(
        records
            .iter()
            .all(|record| record.external_port == record.local_port)
    );
    assert_eq!(test.service.port_mappings().len(), records.len());
}

#[tokio::test]
async fn test_single_port_range() {
    let test = TestService::new(|config| {
        config.network.listen_interfaces = vec!["0.0.0.0".to_string()];
        config.network.listen_port_min = 7000;
        config.network.listen_port_max = 7000;
    });
    let endpoints = test.service.endpoints();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].port, 7000);
    assert_eq!(
        test.session.settings().get_str("listen_interfaces"),
        Some("0.0.0.0:7000")
    );
    assert_eq!(test.session.port_mappings().len(), 2);
}
