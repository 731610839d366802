use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use te::{
    CommandSession, DeviceHandle, DiscoveryConfig, FakeBackend, FakeBackendConfig, PayloadKind,
    Registry, SessionError, TargetFilter, UpdateError, UpdateEvent, UpdateOptions, UpdatePayload,
    UpdateStatus,
};

async fn start(fixture: &str) -> (FakeBackend, CommandSession, Vec<DeviceHandle>) {
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
    (backend, CommandSession::new(registry), handles)
}

fn firmware(len: usize) -> UpdatePayload {
    let bytes: Vec<u8> = (0..=u8::MAX).cycle().take(len).collect();
    UpdatePayload::new(PayloadKind::Firmware, bytes).expect("payload should be valid")
}

#[tokio::test(start_paused = true)]
async fn dropped_ack_is_recovered_with_one_retransmission() -> Result<(), UpdateError> {
    let (backend, session, handles) = start("usb:1-1,drop-ack=0").await;
    let handle = &handles[0];
    let payload = firmware(300);
    let mut events = Vec::new();

    let report = session
        .begin_update(handle, payload.clone(), TargetFilter::All, UpdateOptions::default())
        .await?
        .run(|event| events.push(event.clone()))
        .await?;

    assert_eq!(1, report.retransmissions);
    assert_eq!(56, report.chunk_size);
    assert_eq!(300, report.total);
    assert_eq!(payload.crc32(), report.crc32);
    assert_eq!(UpdateStatus::Success, report.status);
    assert!(report.restarted);
    assert_eq!(Some(payload.bytes().to_vec()), backend.received_update(handle.address()));
    assert_eq!(Some(1), backend.restarts(handle.address()));

    assert_matches!(events.first(), Some(UpdateEvent::Started { total: 300, chunk_size: 56 }));
    assert_matches!(events.get(1), Some(UpdateEvent::Retransmit { offset: 0 }));
    assert_matches!(events.last(), Some(UpdateEvent::Finished(_)));
    let acknowledged: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Progress { acknowledged, .. } => Some(*acknowledged),
            _ => None,
        })
        .collect();
    assert_eq!(vec![56, 112, 168, 224, 280, 300], acknowledged);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn single_stale_ack_is_resent() -> Result<(), UpdateError> {
    let (backend, session, handles) = start("usb:1-1,stale-ack=56").await;
    let handle = &handles[0];
    let payload = firmware(200);

    let report = session
        .update(handle, payload.clone(), TargetFilter::Hid, UpdateOptions::default())
        .await?;

    assert_eq!(1, report.retransmissions);
    assert_eq!(Some(payload.bytes().to_vec()), backend.received_update(handle.address()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_stale_ack_desynchronises() {
    let (_backend, session, handles) = start("usb:1-1,stale-ack=56,stale-count=2").await;

    let result = session
        .update(&handles[0], firmware(200), TargetFilter::All, UpdateOptions::default())
        .await;

    assert_matches!(result, Err(UpdateError::Desync { reported: 56, .. }));
}

#[tokio::test(start_paused = true)]
async fn ack_past_the_chunk_desynchronises() {
    let (_backend, session, handles) = start("usb:1-1,ahead-ack=0").await;

    let result = session
        .update(&handles[0], firmware(200), TargetFilter::All, UpdateOptions::default())
        .await;

    assert_matches!(
        result,
        Err(UpdateError::Desync {
            expected: 56,
            reported: 57
        })
    );
}

#[tokio::test(start_paused = true)]
async fn refusals_end_the_update_before_any_chunk() {
    let (backend, session, handles) = start("usb:1-1,reject-update;usb:2-1,busy").await;

    let rejected = session
        .update(&handles[0], firmware(64), TargetFilter::All, UpdateOptions::default())
        .await;
    let busy = session
        .update(&handles[1], firmware(64), TargetFilter::All, UpdateOptions::default())
        .await;

    assert_matches!(rejected, Err(UpdateError::Rejected { device }) if device == "#0 usb:1-1");
    assert_matches!(busy, Err(UpdateError::Busy { device }) if device == "#1 usb:2-1");
    assert_eq!(None, backend.received_update(handles[0].address()));
}

#[tokio::test(start_paused = true)]
async fn second_missing_ack_for_a_chunk_aborts_the_transfer() {
    let (backend, session, handles) = start("usb:1-1").await;
    let handle = &handles[0];
    let mut transfer = session
        .begin_update(handle, firmware(120), TargetFilter::All, UpdateOptions::default())
        .await
        .expect("update should be accepted");

    assert_matches!(transfer.next_event().await, Some(Ok(UpdateEvent::Started { .. })));
    assert_matches!(
        transfer.next_event().await,
        Some(Ok(UpdateEvent::Progress { acknowledged: 56, .. }))
    );
    assert!(backend.inject(handle.address(), |behaviour| behaviour.silent = true));
    assert_matches!(
        transfer.next_event().await,
        Some(Ok(UpdateEvent::Retransmit { offset: 56 }))
    );
    let aborted = transfer.next_event().await;

    assert_matches!(
        aborted,
        Some(Err(UpdateError::Aborted {
            acknowledged: 56,
            total: 120,
            source,
        })) if matches!(*source, SessionError::Unresponsive { attempts: 2, .. })
    );
    assert!(transfer.next_event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn device_failure_status_fails_the_update() {
    let (_backend, session, handles) = start("usb:1-1,update-status=-1").await;

    let result = session
        .update(&handles[0], firmware(64), TargetFilter::All, UpdateOptions::default())
        .await;

    assert_matches!(result, Err(UpdateError::DeviceFailure { .. }));
}

#[tokio::test(start_paused = true)]
async fn project_update_over_can_uses_large_chunks() -> Result<(), UpdateError> {
    let (backend, session, handles) = start("can0:0xf2").await;
    let handle = &handles[0];
    let bytes: Vec<u8> = (0..600_u32).map(|index| (index % 251) as u8).collect();
    let payload = UpdatePayload::new(PayloadKind::Project, bytes.clone())?;
    let options = UpdateOptions::builder().restart_after(false).build();
    let mut components = Vec::new();

    let report = session
        .begin_update(handle, payload, TargetFilter::Can, options)
        .await?
        .run(|event| {
            if let UpdateEvent::Component { component, .. } = event {
                components.push(component.to_string());
            }
        })
        .await?;

    assert_eq!(256, report.chunk_size);
    assert!(!report.restarted);
    assert_eq!(Some(0), backend.restarts(handle.address()));
    assert_eq!(Some(bytes), backend.received_update(handle.address()));
    assert_eq!(2, components.len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn update_all_reports_every_targeted_device() {
    let (backend, session, handles) = start("usb:1-1;can0:0xf2,busy;can0:0xf3").await;
    let payload = firmware(100);
    let mut finished = Vec::new();

    let results = session
        .update_all(TargetFilter::All, &payload, UpdateOptions::default(), |handle, event| {
            if matches!(event, UpdateEvent::Finished(_)) {
                finished.push(handle.to_string());
            }
        })
        .await;

    assert_eq!(3, results.len());
    assert_matches!(&results[0].1, Ok(report) if report.device == handles[0]);
    assert_matches!(&results[1].1, Err(UpdateError::Busy { .. }));
    assert_matches!(&results[2].1, Ok(_));
    assert_eq!(vec!["#0 usb:1-1", "#2 can0:0xf3"], finished);
    assert_eq!(
        Some(payload.bytes().to_vec()),
        backend.received_update(handles[2].address())
    );
}

#[tokio::test(start_paused = true)]
async fn update_restricted_to_can_rejects_hid_devices() {
    let (_backend, session, handles) = start("usb:1-1").await;

    let result = session
        .update(&handles[0], firmware(64), TargetFilter::Can, UpdateOptions::default())
        .await;

    assert_matches!(result, Err(UpdateError::Validation(_)));
}
