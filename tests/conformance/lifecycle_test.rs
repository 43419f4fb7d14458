use std::time::Duration;

use cdc_listener::{
    CdcListener, ListenerError, ListenerState, SecureSocket, TrustMaterial,
};

use crate::support;

#[actix_rt::test]
async fn stop_halts_delivery_and_is_idempotent() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    support::next_event(&mut rx).await;

    listener.stop().await.unwrap();
    listener.stop().await.unwrap();
    assert_eq!(listener.state().await, ListenerState::Stopped);

    mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGcZAAW",
        serde_json::json!({}),
    );
    support::assert_no_event(&mut rx).await;
}

#[actix_rt::test]
async fn detach_leaves_other_registrations_running() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (first, mut first_rx) = support::recording_handlers();
    let (second, mut second_rx) = support::recording_handlers();
    let first_id = listener.attach(first, support::CHANNEL).await.unwrap();
    listener.attach(second, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    listener.detach(first_id).await.unwrap();

    mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "After detach" }),
    );
    let event = support::next_event(&mut second_rx).await;
    assert_eq!(event.changed_fields["Name"], "After detach");
    support::assert_no_event(&mut first_rx).await;

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn detaching_the_last_registration_cancels_the_subscription() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    let id = listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    listener.detach(id).await.unwrap();

    mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    support::assert_no_event(&mut rx).await;

    listener.stop().await.unwrap();
}

/// Dropping a running listener without stopping it must end the delivery
/// loop. An orphaned loop would keep polling and even re-authenticating with
/// no listener left alive to receive anything.
#[actix_rt::test]
async fn dropped_listener_tears_down_its_delivery_loop() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    let live = mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    assert_eq!(
        support::next_event(&mut rx).await.metadata.commit_number,
        live
    );

    drop(listener);
    // Let the poll issued before the drop come back and the loop notice the
    // connector is gone.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // With every token revoked, a surviving loop would have to log in again
    // to keep polling. Nothing may contact the server from here on.
    mock.revoke_tokens();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mock.login_count(), 1);
    assert_eq!(mock.handshake_count(), 1);
}

#[actix_rt::test]
async fn restart_after_stop_negotiates_a_fresh_session() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();

    listener.start().await.unwrap();
    listener.stop().await.unwrap();
    listener.start().await.unwrap();
    assert_eq!(listener.state().await, ListenerState::Running);

    assert_eq!(mock.login_count(), 2);
    assert_eq!(mock.handshake_count(), 2);
    assert_eq!(mock.subscribe_count(support::CHANNEL), 2);

    let live = mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "Second life" }),
    );
    assert_eq!(
        support::next_event(&mut rx).await.metadata.commit_number,
        live
    );

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn held_subscribe_times_out_and_tears_the_connector_down() {
    let mock = support::spawn_mock().await;
    mock.hold_subscribes(true);

    let config = support::listener_config(&mock)
        .with_connection_timeout(Duration::from_millis(300));
    let listener = CdcListener::new(config);
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();

    let err = listener.start().await.unwrap_err();
    match err {
        ListenerError::ConnectionTimeout { operation, timeout } => {
            assert_eq!(operation, "subscribe");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(listener.state().await, ListenerState::Initialized);

    // Releasing the hold lets a later start succeed with a fresh connector.
    mock.hold_subscribes(false);
    listener.start().await.unwrap();
    let live = mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    assert_eq!(
        support::next_event(&mut rx).await.metadata.commit_number,
        live
    );

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn unusable_trust_material_never_reaches_the_server() {
    let mock = support::spawn_mock().await;
    let config = support::listener_config(&mock).with_secure_socket(SecureSocket {
        key: None,
        trust: Some(TrustMaterial::Pem(String::new())),
    });
    let listener = CdcListener::new(config);
    let (handlers, _rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();

    let err = listener.start().await.unwrap_err();
    assert!(matches!(err, ListenerError::Configuration(_)));
    assert_eq!(mock.login_count(), 0);
    assert_eq!(mock.handshake_count(), 0);
}
