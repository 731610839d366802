use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use te::{
    Brightness, CommandSession, DeviceCommand, DeviceHandle, DiscoveryConfig, FakeBackend,
    FakeBackendConfig, Registry, Response, RetryPolicy, ScreenId, SessionError, Status,
    TargetFilter, TeError, TransportAddress, VariableId, VariableValue, WireDirection,
};

struct Bench {
    backend: FakeBackend,
    registry: Arc<Registry>,
    handles: Vec<DeviceHandle>,
}

impl Bench {
    async fn start(fixture: &str) -> Self {
        let backend = FakeBackend::new(
            FakeBackendConfig::builder()
                .fixture(fixture.parse().expect("fixture should parse"))
                .build(),
        );
        let registry = Arc::new(Registry::new(backend.client()));
        let handles = registry
            .discover(&DiscoveryConfig::default())
            .await
            .expect("discovery should succeed")
            .into_iter()
            .map(|device| device.handle)
            .collect();
        Self {
            backend,
            registry,
            handles,
        }
    }

    fn session(&self) -> CommandSession {
        CommandSession::new(Arc::clone(&self.registry))
    }
}

#[tokio::test(start_paused = true)]
async fn unresponsive_device_is_sent_at_most_retries_plus_one_requests() {
    let bench = Bench::start("usb:1-1").await;
    let handle = &bench.handles[0];
    let policy = RetryPolicy::builder()
        .retries(2)
        .timeout(Duration::from_millis(100))
        .build();
    let session = CommandSession::with_policy(Arc::clone(&bench.registry), policy);
    assert!(bench.backend.inject(handle.address(), |behaviour| behaviour.silent = true));
    bench.backend.wire_log().clear();

    let result = session.screen_get(handle).await;

    assert_matches!(result, Err(SessionError::Unresponsive { attempts: 3, .. }));
    let directions: Vec<WireDirection> = bench
        .backend
        .wire_log()
        .hid_frames("1-1")
        .into_iter()
        .map(|(direction, _frame)| direction)
        .collect();
    assert_eq!(vec![WireDirection::ToDevice; 3], directions);
}

#[tokio::test(start_paused = true)]
async fn per_call_policy_overrides_the_session_deadline() {
    let bench = Bench::start("usb:1-1").await;
    let handle = &bench.handles[0];
    let session = bench.session();
    assert!(bench.backend.inject(handle.address(), |behaviour| behaviour.silent = true));
    let policy = RetryPolicy::builder()
        .retries(0)
        .timeout(Duration::from_millis(50))
        .build();
    let started = Instant::now();

    let result = session
        .execute_with(handle, DeviceCommand::ScreenGet, policy)
        .await;

    assert_matches!(
        result,
        Err(TeError::Session(error)) if matches!(*error, SessionError::Unresponsive { attempts: 1, .. })
    );
    assert!(started.elapsed() < session.policy().timeout());
}

#[tokio::test(start_paused = true)]
async fn concurrent_commands_to_one_device_do_not_interleave() -> Result<(), SessionError> {
    let bench = Bench::start("usb:1-1").await;
    let handle = &bench.handles[0];
    let session = bench.session();
    bench.backend.wire_log().clear();

    let (screen, brightness) = tokio::join!(
        session.screen_set(handle, ScreenId::from(3)),
        session.set_brightness(handle, Brightness::new(40)?, false),
    );

    assert_eq!(Status::Success, screen?);
    assert_eq!(Status::Success, brightness?);
    let directions: Vec<WireDirection> = bench
        .backend
        .wire_log()
        .hid_frames("1-1")
        .into_iter()
        .map(|(direction, _frame)| direction)
        .collect();
    assert_eq!(
        vec![
            WireDirection::ToDevice,
            WireDirection::FromDevice,
            WireDirection::ToDevice,
            WireDirection::FromDevice,
        ],
        directions
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stored_brightness_survives_a_restart() -> Result<(), SessionError> {
    let bench = Bench::start("can0:0xf2").await;
    let handle = &bench.handles[0];
    let session = bench.session();
    let level = Brightness::new(80)?;

    assert_eq!(Status::Success, session.set_brightness(handle, level, true).await?);
    assert_eq!(Status::Success, session.set_brightness(handle, level, true).await?);
    assert_eq!(Status::Success, session.restart(handle, false).await?);

    assert_eq!(Some(80), bench.backend.brightness(handle.address()));
    assert_eq!(Some(1), bench.backend.restarts(handle.address()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn variable_set_over_can_uses_a_transport_protocol_session() -> Result<(), SessionError> {
    let bench = Bench::start("can0:0xf2").await;
    let handle = &bench.handles[0];
    let session = bench.session();
    bench.backend.wire_log().clear();

    let status = session
        .variable_set(
            handle,
            ScreenId::from(6),
            VariableId::from(2),
            VariableValue::Int(20),
        )
        .await?;

    assert_eq!(Status::Success, status);
    let sent: Vec<String> = bench
        .backend
        .wire_log()
        .sent_can_frames("can0")
        .iter()
        .take(3)
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        vec![
            "18ECF211 10 0B 00 02 02 00 EF 00",
            "18EBF211 01 0B 00 03 06 00 02 00",
            "18EBF211 02 14 00 00 00 FF FF FF",
        ],
        sent
    );
    assert_eq!(
        VariableValue::Int(20),
        session
            .variable_get(handle, ScreenId::from(6), VariableId::from(2))
            .await?
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn devices_on_one_interface_are_addressed_independently() -> Result<(), SessionError> {
    let bench = Bench::start("can0:0xf2;can0:0xf3").await;
    let session = bench.session();
    let (first, second) = (&bench.handles[0], &bench.handles[1]);

    session.screen_set(first, ScreenId::from(2)).await?;
    session.screen_set(second, ScreenId::from(5)).await?;

    assert_eq!(ScreenId::from(2), session.screen_get(first).await?);
    assert_eq!(ScreenId::from(5), session.screen_get(second).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn utility_restart_authenticates_then_refreshes_identity() -> Result<(), SessionError> {
    let bench = Bench::start("usb:1-1,fw=2.2.0").await;
    let handle = &bench.handles[0];
    let session = bench.session();
    bench.backend.wire_log().clear();

    assert_eq!(Status::Success, session.restart(handle, true).await?);

    let opcodes: Vec<u8> = bench
        .backend
        .wire_log()
        .hid_frames("1-1")
        .into_iter()
        .filter(|(direction, _frame)| *direction == WireDirection::ToDevice)
        .map(|(_direction, frame)| frame[0])
        .collect();
    assert_eq!(vec![0x01, 0x02, 0x45], opcodes);

    let identity = session.identity(handle).await?;
    assert_eq!("2.2.0", identity.versions.firmware.to_string());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refused_authentication_fails_utility_restart() {
    let bench = Bench::start("usb:1-1,deny-auth").await;
    let handle = &bench.handles[0];

    let result = bench.session().restart(handle, true).await;

    assert_matches!(result, Err(SessionError::AuthenticationFailed { .. }));
    assert_eq!(Some(0), bench.backend.restarts(handle.address()));
}

#[tokio::test(start_paused = true)]
async fn handles_from_an_earlier_discovery_are_stale() {
    let bench = Bench::start("usb:1-1").await;
    let old = bench.handles[0].clone();
    bench
        .registry
        .discover(&DiscoveryConfig::default())
        .await
        .expect("rediscovery should succeed");

    let result = bench.session().screen_get(&old).await;

    assert_matches!(result, Err(SessionError::StaleHandle { device }) if device == "#0 usb:1-1");
}

#[tokio::test(start_paused = true)]
async fn execute_maps_commands_to_responses() -> Result<(), TeError> {
    let bench = Bench::start("usb:1-1").await;
    let handle = &bench.handles[0];
    let session = bench.session();

    let set = session
        .execute(
            handle,
            DeviceCommand::ScreenSet {
                screen: ScreenId::from(4),
            },
        )
        .await?;
    let get = session.execute(handle, DeviceCommand::ScreenGet).await?;

    assert_eq!(Response::Status(Status::Success), set);
    assert_eq!(Response::Screen(ScreenId::from(4)), get);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_for_another_transport_sends_nothing() {
    let bench = Bench::start("usb:1-1").await;
    let handle = &bench.handles[0];
    bench.backend.wire_log().clear();

    let result = bench
        .session()
        .execute(
            handle,
            DeviceCommand::Restart {
                target: TargetFilter::Can,
                utility: false,
            },
        )
        .await;

    assert_matches!(result, Err(TeError::Validation(_)));
    assert!(bench.backend.wire_log().records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_all_reaches_only_targeted_devices() {
    let bench = Bench::start("usb:1-1;can0:0xf2;can0:0xf3").await;

    let results = bench.session().restart_all(TargetFilter::Can, false).await;

    let restarted: Vec<String> = results
        .iter()
        .filter(|(_handle, result)| matches!(result, Ok(Status::Success)))
        .map(|(handle, _result)| handle.address().to_string())
        .collect();
    assert_eq!(vec!["can0:0xf2", "can0:0xf3"], restarted);
    let hid = TransportAddress::Hid { path: "1-1".into() };
    assert_eq!(Some(0), bench.backend.restarts(&hid));
}
