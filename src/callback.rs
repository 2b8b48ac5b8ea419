use std::time::Duration;

use async_trait::async_trait;

use crate::error::FailureReason;

/// One callback call, fully prepared by the delivery worker.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub url: String,

    /// Serialized [`DeliveryPayload`](crate::DeliveryPayload).
    pub body: Vec<u8>,

    /// Extra headers, e.g. signatures.
    pub headers: Vec<(String, String)>,

    /// Maximum time allowed for the call.
    pub timeout: Duration,
}

/// Transport used to reach webhook callbacks.
///
/// `Ok` means the callback acknowledged the whole batch.
#[async_trait]
pub trait CallbackClient: Send + Sync {
    async fn deliver(&self, request: &CallbackRequest) -> Result<(), FailureReason>;
}

/// Delivers callbacks as HTTP POSTs with a JSON body.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpCallbackClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpCallbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl CallbackClient for HttpCallbackClient {
    async fn deliver(&self, request: &CallbackRequest) -> Result<(), FailureReason> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header("Content-Type", "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else if status.is_client_error() {
                    Err(FailureReason::ClientError(status.as_u16()))
                } else {
                    Err(FailureReason::RemoteError(status.as_u16()))
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    Err(FailureReason::Timeout)
                } else {
                    Err(FailureReason::Network)
                }
            }
        }
    }
}
