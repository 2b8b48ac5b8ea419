mod common;

use channel_webhooks::{
    ChannelRequest, Content, Hub, HubError, WebhookRequest, WebhookState,
};
use common::*;

fn webhook_request(channel: &str, start_item: Option<&str>) -> WebhookRequest {
    serde_json::from_value(serde_json::json!({
        "callbackUrl": CALLBACK_URL,
        "channelUrl": format!("{BASE_URL}/channel/{channel}"),
        "startItem": start_item,
    }))
    .unwrap()
}

#[tokio::test]
async fn channel_put_is_last_write_wins() {
    let hub = Hub::with_client(fast_config(), RecordingClient::new());

    let created = hub
        .put_channel(
            "catalog",
            ChannelRequest {
                owner: Some("first".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.status, 201);
    assert_eq!(created.body.links.self_link.href, format!("{BASE_URL}/channel/catalog"));

    let second = hub
        .put_channel(
            "catalog",
            ChannelRequest {
                owner: Some("second".into()),
                tags: vec!["pets".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.status, 201);

    let fetched = hub.get_channel("catalog").await.unwrap();
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.body.owner.as_deref(), Some("second"));
    assert_eq!(fetched.body.tags, vec!["pets".to_string()]);
    assert_eq!(fetched.body.creation_date, created.body.creation_date);

    let json = serde_json::to_value(&fetched.body).unwrap();
    assert_eq!(json["_links"]["latest"]["href"], format!("{BASE_URL}/channel/catalog/latest"));
    assert!(json.get("creationDate").is_some());
}

#[tokio::test]
async fn items_are_numbered_and_readable() {
    let hub = Hub::with_client(fast_config(), RecordingClient::new());
    hub.put_channel("feed", ChannelRequest::default()).await.unwrap();

    let first = hub.post_item("feed", Content::new("a")).await.unwrap();
    let second = hub
        .post_item("feed", Content::new("b").with_content_type("text/plain"))
        .await
        .unwrap();
    assert_eq!(first.status, 201);
    assert_eq!((first.body.sequence, second.body.sequence), (1, 2));
    assert_eq!(second.body.links.self_link.href, item_href("feed", 2));

    let item = hub.get_item("feed", 2).await.unwrap();
    assert_eq!(item.content, b"b");
    assert_eq!(item.content_type.as_deref(), Some("text/plain"));
    assert_eq!(hub.latest_item("feed").await.unwrap().sequence, 2);

    let err = hub.get_item("feed", 3).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    let err = hub.post_item("missing", Content::new("x")).await.unwrap_err();
    assert!(matches!(err, HubError::ChannelNotFound { .. }));
}

#[tokio::test]
async fn latest_on_empty_channel_is_not_found() {
    let hub = Hub::with_client(fast_config(), RecordingClient::new());
    hub.put_channel("empty", ChannelRequest::default()).await.unwrap();
    assert_eq!(hub.latest_item("empty").await.unwrap_err().status_code(), 404);
}

#[tokio::test]
async fn webhook_with_previous_start_receives_last_two_posts() {
    init_tracing();
    let client = RecordingClient::new();
    let hub = Hub::with_client(fast_config(), client.clone());
    hub.put_channel("pets", ChannelRequest::default()).await.unwrap();
    hub.post_item("pets", Content::new("cat")).await.unwrap();
    hub.post_item("pets", Content::new("dog")).await.unwrap();

    let created = hub
        .put_webhook("pet-hook", webhook_request("pets", Some("previous")))
        .await
        .unwrap();
    assert_eq!(created.status, 201);
    assert_eq!(created.body.cursor, 1);

    for body in ["fish", "bird"] {
        hub.post_item("pets", Content::new(body)).await.unwrap();
    }

    assert!(eventually(|| async { client.uris().len() == 3 }).await);
    assert_eq!(
        client.uris(),
        (2..=4).map(|seq| item_href("pets", seq)).collect::<Vec<_>>()
    );
    assert!(client.payloads().iter().all(|p| p.name == "pet-hook"));

    let status = hub.get_webhook("pet-hook").await.unwrap();
    assert_eq!(status.body.state, WebhookState::Active);
    assert!(eventually(|| async {
        hub.get_webhook("pet-hook").await.unwrap().body.cursor == 4
    })
    .await);
    hub.shutdown().await;
}

#[tokio::test]
async fn put_webhook_twice_updates_in_place() {
    let client = RecordingClient::new();
    let hub = Hub::with_client(fast_config(), client.clone());
    hub.put_channel("updates", ChannelRequest::default()).await.unwrap();

    let first = hub
        .put_webhook("upd", webhook_request("updates", None))
        .await
        .unwrap();
    assert_eq!(first.status, 201);
    assert_eq!(first.body.batch, "SINGLE");

    let mut request = webhook_request("updates", None);
    request.batch = Some("bundle".into());
    request.max_items = Some(10);
    let second = hub.put_webhook("upd", request).await.unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.body.batch, "BUNDLE");

    let err = hub
        .put_webhook("upd", webhook_request("elsewhere", None))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    hub.delete_webhook("upd").await.unwrap();
    assert_eq!(hub.get_webhook("upd").await.unwrap_err().status_code(), 404);
    hub.shutdown().await;
}

#[tokio::test]
async fn malformed_webhook_requests_are_rejected() {
    let hub = Hub::with_client(fast_config(), RecordingClient::new());
    hub.put_channel("strict", ChannelRequest::default()).await.unwrap();

    let err = hub
        .put_webhook("bad-start", webhook_request("strict", Some("yesterday")))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let mut request = webhook_request("strict", None);
    request.batch = Some("STREAM".into());
    assert_eq!(
        hub.put_webhook("bad-batch", request).await.unwrap_err().status_code(),
        400
    );

    let err = hub
        .put_webhook("bad name!", webhook_request("strict", None))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Validation { .. }));
}
