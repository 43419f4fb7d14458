use std::sync::Arc;

use cdc_listener::{CdcListener, ListenerConfig, ListenerError};

use crate::support;

#[actix_rt::test]
async fn password_login_establishes_a_streaming_session() {
    let mock = support::spawn_mock().await;
    let listener = CdcListener::new(support::listener_config(&mock));
    let (handlers, _rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();

    listener.start().await.unwrap();

    assert_eq!(mock.login_count(), 1);
    assert_eq!(mock.handshake_count(), 1);
    assert_eq!(mock.subscribe_count(support::CHANNEL), 1);

    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn invalid_credentials_surface_the_login_fault_text() {
    let mock = support::spawn_mock().await;
    let config = support::listener_config(&mock);
    let config = match config.auth {
        cdc_listener::AuthConfig::Password { username, .. } => {
            ListenerConfig::password(username, "wrong-password")
                .with_login_url(mock.base_url().clone())
        }
        other => panic!("unexpected auth config: {other:?}"),
    };
    let listener = CdcListener::new(config);
    let (handlers, _rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();

    let err = listener.start().await.unwrap_err();
    assert!(matches!(err, ListenerError::Authentication(_)));
    assert!(err.to_string().contains("INVALID_LOGIN"), "got: {err}");
    // Negotiation failed, so the streaming endpoints were never touched.
    assert_eq!(mock.handshake_count(), 0);
}

#[actix_rt::test]
async fn token_callback_authenticates_without_password_login() {
    let mock = Arc::new(support::spawn_mock().await);
    let fetcher_mock = mock.clone();
    let config = ListenerConfig::oauth(mock.base_url().clone(), move || {
        Ok(fetcher_mock.mint_token())
    })
    .with_connection_timeout(std::time::Duration::from_secs(2))
    .with_read_timeout(std::time::Duration::from_secs(3));

    let listener = CdcListener::new(config);
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    mock.publish(
        support::CHANNEL,
        "CREATE",
        "Contact",
        "003xx000004TmiQAAS",
        serde_json::json!({ "LastName": "Ngata" }),
    );
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.metadata.entity_name, "Contact");

    assert_eq!(mock.login_count(), 0);
    assert_eq!(mock.minted_token_count(), 1);
    listener.stop().await.unwrap();
}

#[actix_rt::test]
async fn token_endpoint_grants_usable_bearer_tokens() -> anyhow::Result<()> {
    let mock = support::spawn_mock().await;

    let granted: serde_json::Value = reqwest::Client::new()
        .post(mock.base_url().join("services/oauth2/token")?)
        .json(&serde_json::json!({ "grant_type": "client_credentials" }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(granted["token_type"], "Bearer");
    assert_eq!(
        granted["instance_url"].as_str().unwrap(),
        mock.base_url().as_str().trim_end_matches('/')
    );
    let token = granted["access_token"].as_str().unwrap().to_string();
    assert_eq!(mock.token_grant_count(), 1);

    let config = ListenerConfig::oauth(mock.base_url().clone(), move || Ok(token.clone()))
        .with_connection_timeout(std::time::Duration::from_secs(2))
        .with_read_timeout(std::time::Duration::from_secs(3));
    let listener = CdcListener::new(config);
    let (handlers, mut rx) = support::recording_handlers();
    listener.attach(handlers, support::CHANNEL).await.unwrap();
    listener.start().await.unwrap();

    mock.publish(
        support::CHANNEL,
        "UPDATE",
        "Account",
        "001xx0000003DGbYAAW",
        serde_json::json!({ "Name": "Acme" }),
    );
    let event = support::next_event(&mut rx).await;
    assert_eq!(event.changed_fields["Name"], "Acme");

    listener.stop().await.unwrap();
    Ok(())
}
