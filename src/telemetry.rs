use crate::types::WebhookName;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_webhook(name: &'static str, webhook: &WebhookName) {
    ::metrics::increment_counter!(name, "webhook" => webhook.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_webhook(_name: &'static str, _webhook: &WebhookName) {}
