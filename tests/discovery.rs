use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::time::Instant;

use te::{
    DiscoveredDevice, DiscoveryConfig, DiscoveryError, FakeBackend, FakeBackendConfig, HardwareId,
    J1939Id, Registry, TransportKind,
};

fn backend(fixture: &str) -> FakeBackend {
    FakeBackend::new(
        FakeBackendConfig::builder()
            .fixture(fixture.parse().expect("fixture should parse"))
            .build(),
    )
}

fn addresses(devices: &[DiscoveredDevice]) -> Vec<String> {
    devices
        .iter()
        .map(|device| device.handle.address().to_string())
        .collect()
}

#[rstest]
#[case::one_dropped_reply("drop=1", true)]
#[case::two_dropped_replies("drop=2", false)]
#[case::one_malformed_reply("malformed=1", true)]
#[case::silent("silent", false)]
#[tokio::test(start_paused = true)]
async fn identity_query_tolerates_one_lost_reply(
    #[case] fault: &str,
    #[case] listed: bool,
) -> Result<(), DiscoveryError> {
    let backend = backend(&format!("can0:0xf2,{fault};usb:1-1,{fault}"));
    let registry = Registry::new(backend.client());

    let devices = registry.discover(&DiscoveryConfig::default()).await?;

    let expected: Vec<&str> = if listed {
        vec!["usb:1-1", "can0:0xf2"]
    } else {
        Vec::new()
    };
    assert_eq!(expected, addresses(&devices));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn identities_reflect_the_transport() -> Result<(), DiscoveryError> {
    let registry = Registry::new(backend("usb:1-1;can0:0xf2,fw=2.2.0").client());

    let devices = registry.discover(&DiscoveryConfig::default()).await?;

    assert_eq!(TransportKind::Hid, devices[0].handle.kind());
    assert_eq!(HardwareId::RefreshUsb, devices[0].identity.hardware_id);
    assert_eq!("2.1.7", devices[0].identity.versions.firmware.to_string());
    assert_eq!(TransportKind::Can, devices[1].handle.kind());
    assert_eq!(HardwareId::RefreshCan, devices[1].identity.hardware_id);
    assert_eq!("2.2.0", devices[1].identity.versions.firmware.to_string());
    assert_eq!(devices, registry.devices().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_discovery_keeps_order_and_indices() -> Result<(), DiscoveryError> {
    let registry = Registry::new(backend("can0:0xf3;can0:0xf2").client());
    let expected = vec![(0, "can0:0xf2".to_owned()), (1, "can0:0xf3".to_owned())];

    for _ in 0..3 {
        let devices = registry.discover(&DiscoveryConfig::default()).await?;
        let listed: Vec<(usize, String)> = devices
            .iter()
            .map(|device| (device.handle.index(), device.handle.address().to_string()))
            .collect();
        assert_eq!(expected, listed);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discovered_devices_serialise_for_json_output() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::new(backend("usb:1-1").client());

    let devices = registry.discover(&DiscoveryConfig::default()).await?;
    let value = serde_json::to_value(&devices[0])?;

    assert_eq!("#0 usb:1-1", value["handle"]);
    assert_eq!("TE_RF_USB", value["identity"]["hardware_id"]);
    assert_eq!("2.1.7", value["identity"]["versions"]["firmware"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn can_discovery_uses_the_configured_tool_address() -> Result<(), DiscoveryError> {
    let backend = backend("can0:0xf2");
    let registry = Registry::new(backend.client());
    let config = DiscoveryConfig::builder()
        .hid(false)
        .can_interfaces(vec!["can0".to_owned()])
        .tool_address(0x20)
        .build();

    let devices = registry.discover(&config).await?;

    assert_eq!(vec!["can0:0xf2"], addresses(&devices));
    let sources: Vec<u8> = backend
        .wire_log()
        .sent_can_frames("can0")
        .iter()
        .map(|frame| J1939Id::from_raw(frame.id()).source)
        .collect();
    assert!(!sources.is_empty());
    assert!(sources.iter().all(|source| *source == 0x20 || *source == 0xFE));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn skipped_hid_leaves_only_can_devices() -> Result<(), DiscoveryError> {
    let registry = Registry::new(backend("usb:1-1;can0:0xf2;can1:0x80").client());
    let config = DiscoveryConfig::builder()
        .hid(false)
        .can_interfaces(vec!["can1".to_owned()])
        .build();

    let devices = registry.discover(&config).await?;

    assert_eq!(vec!["can1:0x80"], addresses(&devices));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn one_unavailable_interface_does_not_fail_discovery() -> Result<(), DiscoveryError> {
    let registry = Registry::new(backend("can0:0xf2").client());
    let config = DiscoveryConfig::builder()
        .hid(false)
        .can_interfaces(vec!["can9".to_owned(), "can0".to_owned()])
        .build();

    let devices = registry.discover(&config).await?;

    assert_eq!(vec!["can0:0xf2"], addresses(&devices));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_openable_transport_is_an_error() {
    let registry = Registry::new(backend("usb:1-1").client());
    let config = DiscoveryConfig::builder()
        .hid(false)
        .can_interfaces(vec!["can9".to_owned(), "can8".to_owned()])
        .build();

    let result = registry.discover(&config).await;

    assert_matches!(result, Err(DiscoveryError::NoTransportAvailable { attempted: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn enumeration_delay_is_honoured() -> Result<(), DiscoveryError> {
    let backend = FakeBackend::new(
        FakeBackendConfig::builder()
            .fixture("usb:1-1".parse().expect("fixture should parse"))
            .enumeration_delay(Duration::from_millis(250))
            .build(),
    );
    let registry = Registry::new(backend.client());
    let started = Instant::now();

    registry.discover(&DiscoveryConfig::default()).await?;

    assert!(started.elapsed() >= Duration::from_millis(250));
    Ok(())
}
