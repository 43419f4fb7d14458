use cdc_listener::CdcListener;

use crate::support;

/// Forced credential expiry: the listener must mint exactly one replacement
/// token, renew the server-side session, and resubscribe each channel exactly
/// once at its recorded position, with no redelivery and no event loss.
#[actix_rt::test]
async fn expired_token_renews_the_session_without_duplicating_subscriptions() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    let first = mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "Before expiry" }),
    );
    assert_eq!(
        support::next_event(&mut rx).await.metadata.commit_number,
        first
    );

    mock.revoke_tokens();
    // The next poll is rejected with 401, which must drive a second login
    // followed by a session renewal.
    support::wait_until("the listener to log in again", || mock.login_count() == 2).await;
    support::wait_until("the renewed session to resubscribe", || {
        mock.subscribe_count(support::CHANNEL) == 2
    })
    .await;

    let second = mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "After renewal" }),
    );
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.metadata.commit_number, second);
    assert_eq!(event.changed_fields["Name"], "After renewal");

    // Exactly one replacement token and one resubscribe; the event delivered
    // before expiry is not replayed.
    assert_eq!(mock.minted_token_count(), 2);
    assert_eq!(mock.handshake_count(), 2);
    assert_eq!(mock.subscribe_count(support::CHANNEL), 2);
    support::assert_no_event(&mut rx).await;

    listener.stop().await.unwrap();
}

/// A resubscribe that fails during session renewal must be retried by later
/// polls. Without the retry the renewed session polls an empty subscription
/// set, connects keep succeeding, and the channel starves silently.
#[actix_rt::test]
async fn failed_renewal_resubscribe_is_retried_until_the_channel_heals() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    // One delivery first, so the channel resumes from a concrete replay id
    // rather than the latest-only sentinel.
    let first = mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "Before expiry" }),
    );
    assert_eq!(
        support::next_event(&mut rx).await.metadata.commit_number,
        first
    );

    // Expire the session while subscribes stall: the renewal's handshake
    // succeeds but its resubscribe attempt times out.
    mock.hold_subscribes(true);
    mock.revoke_tokens();
    support::wait_until("the listener to log in again", || mock.login_count() == 2).await;
    support::wait_until("the renewed session to handshake", || {
        mock.handshake_count() == 2
    })
    .await;
    mock.hold_subscribes(false);

    let second = mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "After heal" }),
    );

    // The flagged channel is resubscribed on a later poll and delivery
    // resumes from its recorded position.
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.metadata.commit_number, second);
    assert_eq!(event.changed_fields["Name"], "After heal");
    assert_eq!(mock.subscribe_count(support::CHANNEL), 2);
    support::assert_no_event(&mut rx).await;

    listener.stop().await.unwrap();
}
