use channel_webhooks::{build_signature_headers, verify_callback, DeliveryPayload};

fn main() {
    let payload = DeliveryPayload {
        name: "orders-feed".to_string(),
        uris: vec!["http://localhost:8080/channel/orders/2".to_string()],
    };
    let body = serde_json::to_vec(&payload).unwrap_or_default();

    // What the hub attaches to a callback for a webhook with a secret.
    let sent_at = 1_700_000_000;
    let headers = build_signature_headers(b"supersecret", &body, sent_at);

    let now_secs = 1_700_000_200;
    let result = verify_callback(
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &body,
        b"supersecret",
        300,
        now_secs,
    );
    println!("{:?}", result);
}
