use cdc_listener::{CdcListener, ChangeType, HandlerSet};
use tokio::sync::mpsc;

use crate::support;

#[actix_rt::test]
async fn update_events_carry_changed_fields_and_metadata() -> anyhow::Result<()> {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await?;
    listener.start().await?;

    // Inject over the wire hook rather than the in-process handle.
    let ack: serde_json::Value = reqwest::Client::new()
        .post(mock.base_url().join("api/event")?)
        .json(&serde_json::json!({
            "channel": support::CHANNEL,
            "changeType": "UPDATE",
            "entityName": "Account",
            "recordId": "001xx0000003DGbYAAW",
            "changedFields": { "Name": "Acme Rebranded", "Phone": "+1-555-0100" }
        }))
        .send()
        .await?
        .json()
        .await?;
    let replay_id = ack["replayId"].as_i64().unwrap();
    assert_eq!(replay_id, 1);

    let event = support::next_event(&mut rx).await;
    assert_eq!(event.metadata.change_type, ChangeType::Update);
    assert_eq!(event.metadata.entity_name, "Account");
    assert_eq!(event.metadata.record_id, "001xx0000003DGbYAAW");
    assert_eq!(event.metadata.commit_number, replay_id);
    assert_eq!(event.changed_fields["Name"], "Acme Rebranded");
    assert_eq!(event.changed_fields["Phone"], "+1-555-0100");
    assert!(!event.changed_fields.contains_key("ChangeEventHeader"));

    listener.stop().await?;
    Ok(())
}

#[actix_rt::test]
async fn events_without_a_matching_handler_are_skipped() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handlers = HandlerSet::new().on_create(move |event: cdc_listener::ChangeEvent| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    mock.publish(
        support::CHANNEL,
        "DELETE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    support::assert_no_event(&mut rx).await;

    mock.publish(
        support::CHANNEL,
        "CREATE",
        "Account",
        "001xx0000003DGcZAAW",
        serde_json::json!({ "Name": "New Co" }),
    );
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.metadata.change_type, ChangeType::Create);
    assert_eq!(event.metadata.record_id, "001xx0000003DGcZAAW");

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn delivery_is_in_order_and_at_most_once() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    let mut published = Vec::new();
    for n in 0..5 {
        published.push(mock.publish(
            support::CHANNEL,
            "UPDATE",
            "Account",
            "001xx0000003DGbYAAW",
            serde_json::json!({ "Employees": n }),
        ));
    }

    for expected in &published {
        let event = support::next_event(&mut rx).await;
        assert_eq!(event.metadata.commit_number, *expected);
    }
    support::assert_no_event(&mut rx).await;

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn every_registration_on_a_channel_receives_the_event() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (first, mut first_rx) = support::recording_handlers();
    let (second, mut second_rx) = support::recording_handlers();
    listener.attach(first, support::CHANNEL).await.unwrap();
    listener.attach(second, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    // One channel, one subscription, two registrations fanned out to.
    assert_eq!(mock.subscribe_count(support::CHANNEL), 1);

    mock.publish(
        support::CHANNEL,
        "UNDELETE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    assert_eq!(
        support::next_event(&mut first_rx).await.metadata.change_type,
        ChangeType::Undelete
    );
    assert_eq!(
        support::next_event(&mut second_rx).await.metadata.change_type,
        ChangeType::Undelete
    );

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn unclassifiable_payloads_are_dropped_not_fatal() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    // Gap events carry change types outside the dispatchable set.
    mock.publish(
        support::CHANNEL,
        "GAP_UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({}),
    );
    support::assert_no_event(&mut rx).await;

    // The stream keeps flowing afterwards.
    mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "Still Alive" }),
    );
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.changed_fields["Name"], "Still Alive");

    listener.stop().await.unwrap();
}
