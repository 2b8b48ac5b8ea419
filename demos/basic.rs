use channel_webhooks::{ChannelRequest, Content, DispatcherConfig, Hub, WebhookRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let hub = Hub::new(DispatcherConfig::default());

    hub.put_channel(
        "orders",
        ChannelRequest {
            owner: Some("fulfilment".to_string()),
            ..Default::default()
        },
    )
    .await?;
    hub.post_item("orders", Content::new(r#"{"id":122}"#).with_content_type("application/json"))
        .await?;

    let request: WebhookRequest = serde_json::from_value(serde_json::json!({
        "callbackUrl": "https://example.com/webhook",
        "channelUrl": "http://localhost:8080/channel/orders",
        "startItem": "previous",
        "secret": "supersecret",
    }))?;
    let webhook = hub.put_webhook("orders-feed", request).await?;
    println!("{}", serde_json::to_string_pretty(&webhook.body)?);

    hub.post_item("orders", Content::new(r#"{"id":123}"#).with_content_type("application/json"))
        .await?;

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    hub.shutdown().await;
    Ok(())
}
