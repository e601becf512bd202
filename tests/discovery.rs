//! Vehicle discovery over the simulated network: announcement collection,
//! filters, deduplication, malformed datagrams and the empty-network case.

mod helpers;

use std::time::Duration;

use doip_client::{Eid, LogicalAddress, VehicleInfoRequest, Vin};
use helpers::*;
use turmoil::net::UdpSocket;

fn sim() -> turmoil::Sim<'static> {
    turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .build()
}

#[test_log::test]
fn empty_filter_collects_announced_server() {
    let mut sim = sim();
    sim.host("ecu", || run_ecu(EcuBehavior::default()));

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::Any)
            .await?;

        assert_eq!(servers.len(), 1);
        let server = &servers[0];
        assert_eq!(server.logical_address, LogicalAddress::new(ECU_LOGICAL));
        assert_eq!(server.vin.to_string(), VIN_STR);
        assert_eq!(server.eid.to_string(), EID_STR);
        assert_eq!(server.gid.to_string(), GID_STR);
        assert_eq!(server.ip, turmoil::lookup("ecu"));

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn no_responders_returns_empty_after_window() {
    let mut sim = sim();
    sim.host("ecu", || {
        run_ecu(EcuBehavior {
            announce: false,
            ..EcuBehavior::default()
        })
    });

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let started = tokio::time::Instant::now();
        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::Any)
            .await?;
        let elapsed = started.elapsed();

        // Empty is success, delivered only once the window elapses
        assert!(servers.is_empty());
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn duplicate_announcements_are_deduplicated() {
    let mut sim = sim();
    sim.host("ecu", || {
        run_ecu(EcuBehavior {
            announce_copies: 3,
            ..EcuBehavior::default()
        })
    });

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::Any)
            .await?;
        assert_eq!(servers.len(), 1);

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn vin_filter_is_honored_by_the_server() {
    let mut sim = sim();
    sim.host("ecu", || run_ecu(EcuBehavior::default()));

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let other_vin = Vin::parse("ZZZZZZZZ000000000").unwrap();
        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::ByVin(other_vin))
            .await?;
        assert!(servers.is_empty());

        let matching = Vin::parse(VIN_STR).unwrap();
        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::ByVin(matching))
            .await?;
        assert_eq!(servers.len(), 1);

        let eid = Eid::parse(EID_STR).unwrap();
        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::ByEid(eid))
            .await?;
        assert_eq!(servers.len(), 1);

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn malformed_datagrams_are_discarded_not_fatal() {
    let mut sim = sim();

    // A server that answers every identification request with garbage
    // first, then a valid announcement
    sim.host("ecu", || async {
        let udp = UdpSocket::bind("0.0.0.0:13400").await?;
        let mut buf = [0u8; 256];
        loop {
            let (_, from) = udp.recv_from(&mut buf).await?;
            // Bad inverse version byte
            udp.send_to(&[0x02, 0x00, 0x00, 0x04, 0, 0, 0, 0], from).await?;
            // Truncated header
            udp.send_to(&[0xFF], from).await?;
            let announcement = EcuBehavior::default().announcement_message();
            udp.send_to(&announcement, from).await?;
        }
    });

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let servers = client
            .send_vehicle_identification_request(VehicleInfoRequest::Any)
            .await?;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].logical_address, LogicalAddress::new(ECU_LOGICAL));

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn concurrent_discoveries_share_one_window() {
    let mut sim = sim();
    sim.host("ecu", || run_ecu(EcuBehavior::default()));

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            client.send_vehicle_identification_request(VehicleInfoRequest::Any),
            client.send_vehicle_identification_request(VehicleInfoRequest::Any),
        );
        let elapsed = started.elapsed();

        assert_eq!(first?.len(), 1);
        assert_eq!(second?.len(), 1);
        // Both waited on the same window, not two back to back
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}

#[test_log::test]
fn server_list_is_fed_by_discovery() {
    let mut sim = sim();
    sim.host("ecu", || run_ecu(EcuBehavior::default()));

    sim.client("tester", async move {
        let client = SimClient::with_config(client_config("RemoteDiagnostics", "ecu"));
        client.initialize().await?;

        assert!(client.get_diagnostic_server_list().await?.is_empty());

        client
            .send_vehicle_identification_request(VehicleInfoRequest::Any)
            .await?;

        let known = client.get_diagnostic_server_list().await?;
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].logical_address, LogicalAddress::new(ECU_LOGICAL));

        client.deinitialize().await?;
        Ok(())
    });

    sim.run().unwrap();
}
