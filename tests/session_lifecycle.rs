use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use elmlink::{
    AdapterPower, AdapterSession, ErrorKind, FakeBackend, FakeBackendConfig, ReplyScript,
    ResponseShape, ServiceFixture, ServiceInventory, SessionConfig, SessionError, SessionSnapshot,
    StateSubscription, WriteMode,
};

fn session_over(fake: &FakeBackend) -> AdapterSession {
    AdapterSession::new(Arc::new(fake.clone()), SessionConfig::default())
}

fn inventory(fixture: &str) -> ServiceInventory {
    fixture
        .parse::<ServiceFixture>()
        .expect("test fixture should parse")
        .into()
}

async fn wait_for<F>(subscription: &mut StateSubscription, predicate: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    loop {
        let snapshot = subscription.next().await.expect("session should stay alive");
        if predicate(&snapshot) {
            return snapshot;
        }
    }
}

#[tokio::test]
async fn handshake_falls_through_to_the_first_matching_profile() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .inventory(inventory("ffe0:ffe1=write_without_response+notify"))
            .build(),
    );
    let session = session_over(&fake);
    session.initialize().await?;

    let profile = session.connect(fake.device_id()).await?;

    assert_eq!("ffe0_ffe1", profile.profile());
    assert_eq!(WriteMode::WithoutResponse, profile.write_mode());
    assert_eq!(
        vec![(
            "0000ffe0-0000-1000-8000-00805f9b34fb".to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
        )],
        fake.notifications_started()
    );
    Ok(())
}

#[tokio::test]
async fn handshake_skips_a_candidate_whose_notification_setup_fails() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .inventory(inventory(
                "ffe0:ffe1=write_without_response+notify;\
                 e7810a71-73ae-499d-8c15-faa9aef0c3f2:\
                 be781a71-73ae-499d-8c15-faa9aef0c3f2=write+notify",
            ))
            .build(),
    );
    fake.fail_start_notifications(1);
    let session = session_over(&fake);
    session.initialize().await?;

    let profile = session.connect(fake.device_id()).await?;

    assert_eq!("e781_be78", profile.profile());
    assert_eq!(WriteMode::WithResponse, profile.write_mode());
    Ok(())
}

#[tokio::test]
async fn handshake_exhausting_the_catalog_is_incompatible() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .inventory(inventory("180d:2a37=notify"))
            .build(),
    );
    let session = session_over(&fake);
    session.initialize().await?;
    let mut subscription = session.subscribe().await?;

    let result = session.connect(fake.device_id()).await;

    assert_matches!(result, Err(SessionError::Incompatible));
    let settled = wait_for(&mut subscription, |snapshot| {
        !snapshot.connection().is_connected() && snapshot.last_error().is_some()
    })
    .await;
    assert_eq!(Some(ErrorKind::Incompatible), settled.last_error());
    Ok(())
}

#[tokio::test]
async fn catalog_override_replaces_the_built_in_profiles() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .inventory(inventory("fff0:fff1=write+notify,fff2=notify"))
            .build(),
    );
    let custom = vec![elmlink::ProfileCandidate::new(
        "fff0_split",
        "FFF0",
        "FFF1",
        "FFF2",
        None,
    )];
    let session = AdapterSession::new(
        Arc::new(fake.clone()),
        SessionConfig::builder().catalog(custom).build(),
    );
    session.initialize().await?;

    let profile = session.connect(fake.device_id()).await?;

    assert_eq!("fff0_split", profile.profile());
    assert_eq!(WriteMode::WithResponse, profile.write_mode());
    assert_eq!(
        vec![(
            "0000fff0-0000-1000-8000-00805f9b34fb".to_string(),
            "0000fff2-0000-1000-8000-00805f9b34fb".to_string(),
        )],
        fake.notifications_started()
    );
    Ok(())
}

#[tokio::test]
async fn connect_preconditions_are_enforced() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = session_over(&fake);
    session.initialize().await?;
    session.connect(fake.device_id()).await?;

    let again = session.connect(fake.device_id()).await;
    assert_matches!(again, Err(SessionError::AlreadyConnected));
    Ok(())
}

#[tokio::test]
async fn connect_requires_the_adapter_radio_to_be_on() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::builder().adapter_on(false).build());
    let session = session_over(&fake);
    session.initialize().await?;

    let result = session.connect(fake.device_id()).await;

    assert_matches!(result, Err(SessionError::BluetoothOff));
    Ok(())
}

#[tokio::test]
async fn connect_failure_surfaces_the_transport_fault() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    fake.fail_next_connect("pairing refused");
    let session = session_over(&fake);
    session.initialize().await?;

    let result = session.connect(fake.device_id()).await;

    assert_matches!(result, Err(SessionError::Transport(_)));

    let retried = session.connect(fake.device_id()).await?;
    assert_eq!("ffe0_ffe1", retried.profile());
    Ok(())
}

#[tokio::test]
async fn disconnect_is_idempotent() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = session_over(&fake);
    session.initialize().await?;

    session.disconnect().await?;

    session.connect(fake.device_id()).await?;
    session.disconnect().await?;
    session.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_mid_command_rejects_the_pending_send() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .replies(vec![ReplyScript::chunks([vec![0x31]]).then_drop()])
            .build(),
    );
    let session = session_over(&fake);
    session.initialize().await?;
    session.connect(fake.device_id()).await?;

    let result = session.send("ATRV", ResponseShape::Text).await;
    assert_matches!(result, Err(SessionError::Disconnected));

    let next = session.send("ATRV", ResponseShape::Text).await;
    assert_matches!(next, Err(SessionError::NotConnected));
    Ok(())
}

#[tokio::test]
async fn unexpected_disconnect_resets_the_session() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = session_over(&fake);
    session.initialize().await?;
    session.connect(fake.device_id()).await?;
    session.set_streaming(true).await?;
    let mut subscription = session.subscribe().await?;

    fake.emit_disconnected();

    let settled = wait_for(&mut subscription, |snapshot| {
        !snapshot.connection().is_connected()
    })
    .await;
    assert!(!settled.streaming());
    assert_eq!(Some(ErrorKind::Disconnected), settled.last_error());

    let reconnected = session.connect(fake.device_id()).await?;
    assert_eq!("ffe0_ffe1", reconnected.profile());
    Ok(())
}

#[tokio::test]
async fn adapter_power_loss_resets_the_connection() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = session_over(&fake);
    session.initialize().await?;
    session.connect(fake.device_id()).await?;
    let mut subscription = session.subscribe().await?;

    fake.emit_adapter_state(AdapterPower::Off);

    let settled = wait_for(&mut subscription, |snapshot| !snapshot.bluetooth_on()).await;
    assert!(!settled.connection().is_connected());

    let result = session.connect(fake.device_id()).await;
    assert_matches!(result, Err(SessionError::BluetoothOff));

    fake.emit_adapter_state(AdapterPower::On);
    assert!(session.query_adapter_state().await?);
    session.connect(fake.device_id()).await?;
    Ok(())
}

#[tokio::test]
async fn initialize_surfaces_transport_start_failures() {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    fake.fail_transport_start("dbus unavailable");
    let session = session_over(&fake);

    let result = session.initialize().await;

    assert_matches!(result, Err(SessionError::TransportInit(_)));
}

#[tokio::test]
async fn subscription_reports_the_connected_profile() -> anyhow::Result<()> {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = session_over(&fake);
    session.initialize().await?;
    let mut subscription = session.subscribe().await?;
    assert!(!subscription.initial().connection().is_connected());

    session.connect(fake.device_id()).await?;

    let connected = wait_for(&mut subscription, |snapshot| {
        snapshot.connection().is_connected()
    })
    .await;
    assert_eq!(
        elmlink::ConnectionSummary::Connected {
            device: fake.device_id(),
            profile: "ffe0_ffe1".to_string(),
            write_mode: WriteMode::WithoutResponse,
        },
        *connected.connection()
    );
    Ok(())
}
