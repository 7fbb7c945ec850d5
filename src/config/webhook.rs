//! Inbound deposit-webhook configuration

use std::env;

/// Shared-secret configuration for the chain gateway's push notifications.
///
/// When no secret is configured the signature check is explicitly opted out
/// of; an empty DEPOSIT_WEBHOOK_SECRET means "no secret", never "empty key".
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: Option<String>,
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        let secret = env::var("DEPOSIT_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        if secret.is_none() {
            tracing::warn!(
                "DEPOSIT_WEBHOOK_SECRET not set - inbound deposit webhooks will NOT be authenticated"
            );
        }

        Self { secret }
    }

    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}
