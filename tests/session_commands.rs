use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use elmlink::{
    AdapterSession, CommandResponse, FakeBackend, FakeBackendConfig, ReplyScript, ResponseShape,
    SessionConfig, SessionError, WriteMode,
};

fn fake_with_replies(replies: Vec<ReplyScript>) -> FakeBackend {
    FakeBackend::new(FakeBackendConfig::builder().replies(replies).build())
}

async fn connected_session(fake: &FakeBackend) -> AdapterSession {
    let session = AdapterSession::new(Arc::new(fake.clone()), SessionConfig::default());
    session.initialize().await.expect("initialize should succeed");
    session
        .connect(fake.device_id())
        .await
        .expect("connect should succeed");
    session
}

#[tokio::test]
async fn send_resolves_text_when_the_terminator_arrives() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([
        vec![0x45, 0x4C, 0x4D, 0x33, 0x32, 0x37],
        vec![0x20, 0x76, 0x31, 0x2E, 0x35, 0x3E],
    ])]);
    let session = connected_session(&fake).await;

    let response = session.send("ATZ", ResponseShape::Text).await?;

    assert_eq!(CommandResponse::Text("ELM327 v1.5".to_string()), response);
    let written = fake.written();
    assert_eq!(1, written.len());
    assert_eq!(b"ATZ\r".to_vec(), written[0].payload);
    assert_eq!(WriteMode::WithoutResponse, written[0].mode);
    Ok(())
}

#[tokio::test]
async fn send_preserves_chunk_boundaries() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([
        vec![0x34, 0x33, 0x0D],
        vec![0x00, 0x00, 0x3E],
    ])]);
    let session = connected_session(&fake).await;

    let response = session.send("03", ResponseShape::Chunked).await?;

    let CommandResponse::Chunked { flat, chunks } = response else {
        panic!("expected chunked response");
    };
    assert_eq!(vec![vec![0x34, 0x33, 0x0D], vec![0x00, 0x00]], chunks);
    assert_eq!(vec![0x34, 0x33, 0x0D, 0x00, 0x00], flat);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_resolves_with_partial_data_on_timeout() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([vec![0x34, 0x31, 0x30, 0x43]])]);
    let session = connected_session(&fake).await;
    let mut subscription = session.subscribe().await?;
    let started = tokio::time::Instant::now();

    let response = session
        .send_with_timeout("010C", ResponseShape::Bytes, Some(Duration::from_millis(100)))
        .await?;

    assert_eq!(CommandResponse::Bytes(vec![0x34, 0x31, 0x30, 0x43]), response);
    assert!(started.elapsed() >= Duration::from_millis(100));

    let resolved = loop {
        let snapshot = subscription.next().await.expect("session should stay alive");
        if !snapshot.command_in_flight() && snapshot.last_success_offset().is_some() {
            break snapshot;
        }
    };
    assert_eq!(None, resolved.last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_resolves_empty_payload_on_silent_timeout() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::silence()]);
    let session = connected_session(&fake).await;

    let response = session
        .send_with_timeout("ATE0", ResponseShape::Bytes, Some(Duration::from_millis(50)))
        .await?;

    assert_eq!(CommandResponse::Bytes(Vec::new()), response);
    Ok(())
}

#[tokio::test]
async fn terminator_as_first_byte_yields_empty_success() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([vec![0x3E]])]);
    let session = connected_session(&fake).await;

    let response = session.send("ATZ", ResponseShape::Text).await?;

    assert_eq!(CommandResponse::Text(String::new()), response);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_send_fails_while_the_first_is_in_flight() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::silence()]);
    let session = connected_session(&fake).await;

    let first = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .send_with_timeout("0100", ResponseShape::Bytes, Some(Duration::from_secs(1)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = session.send("0101", ResponseShape::Bytes).await;
    assert_matches!(second, Err(SessionError::CommandPending));

    let resolved = first.await.expect("first send task should not panic")?;
    assert_eq!(CommandResponse::Bytes(Vec::new()), resolved);
    Ok(())
}

#[tokio::test]
async fn send_without_a_connection_fails_fast() {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = AdapterSession::new(Arc::new(fake.clone()), SessionConfig::default());
    session.initialize().await.expect("initialize should succeed");

    let result = session.send("ATZ", ResponseShape::Text).await;

    assert_matches!(result, Err(SessionError::NotConnected));
}

#[tokio::test]
async fn rejected_write_surfaces_a_write_error_and_recovers() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([b"OK\r>".to_vec()])]);
    let session = connected_session(&fake).await;

    fake.fail_next_write("gatt busy");
    let failed = session.send("ATZ", ResponseShape::Text).await;
    assert_matches!(failed, Err(SessionError::Write(_)));

    let recovered = session.send("ATZ", ResponseShape::Text).await?;
    assert_eq!(CommandResponse::Text("OK".to_string()), recovered);
    Ok(())
}

#[tokio::test]
async fn stray_notifications_are_not_buffered_across_commands() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![ReplyScript::chunks([b"OK>".to_vec()])]);
    let session = connected_session(&fake).await;

    fake.emit_notification(&[0x99, 0x98]);
    tokio::task::yield_now().await;

    let response = session.send("ATE0", ResponseShape::Bytes).await?;
    assert_eq!(CommandResponse::Bytes(b"OK".to_vec()), response);
    Ok(())
}

#[tokio::test]
async fn successful_sends_advance_last_success_monotonically() -> anyhow::Result<()> {
    let fake = fake_with_replies(vec![
        ReplyScript::chunks([b"41 0C 1A F8>".to_vec()]),
        ReplyScript::chunks([b"41 0D 32>".to_vec()]),
    ]);
    let session = connected_session(&fake).await;
    let mut subscription = session.subscribe().await?;

    session.send("010C", ResponseShape::Text).await?;
    session.send("010D", ResponseShape::Text).await?;

    let mut offsets = Vec::new();
    while offsets.len() < 2 {
        let snapshot = subscription.next().await.expect("session should stay alive");
        if let Some(offset) = snapshot.last_success_offset()
            && offsets.last() != Some(&offset)
        {
            offsets.push(offset);
        }
    }
    assert!(offsets[0] < offsets[1], "offsets should strictly increase");
    Ok(())
}

#[tokio::test]
async fn write_mode_follows_the_matched_profile() -> anyhow::Result<()> {
    let fake = FakeBackend::new(
        FakeBackendConfig::builder()
            .inventory(elmlink::CannedInventory::TransparentUart.inventory())
            .replies(vec![ReplyScript::chunks([b"OK>".to_vec()])])
            .build(),
    );
    let session = connected_session(&fake).await;

    session.send("ATSP0", ResponseShape::Text).await?;

    assert_eq!(WriteMode::WithResponse, fake.written()[0].mode);
    Ok(())
}

#[tokio::test]
async fn calls_after_shutdown_fail_with_closed() {
    let fake = FakeBackend::new(FakeBackendConfig::default());
    let session = AdapterSession::new(Arc::new(fake.clone()), SessionConfig::default());

    session.shutdown();
    tokio::task::yield_now().await;

    let result = session.send("ATZ", ResponseShape::Text).await;
    assert_matches!(result, Err(SessionError::Closed));
}
