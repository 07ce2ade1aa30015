//! Outbound Messenger delivery and inbound webhook signature checks.

use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use crate::backoff;
use crate::config::{env_optional, MessengerConfig, FB_PAGE_ACCESS_TOKEN};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Delivers a text reply to a messaging identity.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// `true` when the platform accepted the message. Never errors.
    async fn send(&self, identity: &str, text: &str) -> bool;
}

/// Graph API Send API client.
pub struct GraphMessenger {
    client: reqwest::Client,
    base_url: String,
    page_token: Option<String>,
}

impl GraphMessenger {
    pub fn from_config(config: &MessengerConfig) -> Result<Self> {
        Self::new(config, env_optional(FB_PAGE_ACCESS_TOKEN))
    }

    pub fn new(config: &MessengerConfig, page_token: Option<String>) -> Result<Self> {
        if page_token.is_none() {
            tracing::warn!("{} is not set, replies will not be delivered", FB_PAGE_ACCESS_TOKEN);
        }
        Ok(Self {
            client: backoff::client(config.timeout_secs)?,
            base_url: config.graph_api_base.trim_end_matches('/').to_string(),
            page_token,
        })
    }
}

#[async_trait]
impl Messenger for GraphMessenger {
    async fn send(&self, identity: &str, text: &str) -> bool {
        let Some(token) = &self.page_token else {
            return false;
        };
        let payload = json!({
            "recipient": { "id": identity },
            "message": { "text": text },
        });
        let result = self
            .client
            .post(format!("{}/me/messages", self.base_url))
            .query(&[("access_token", token)])
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(identity, status = %resp.status(), "send API rejected message");
                false
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "send API request failed");
                false
            }
        }
    }
}

/// Check an `X-Hub-Signature-256` header (`sha256=<hex>`) against the
/// HMAC-SHA256 of the raw body. Comparison is constant-time.
pub fn verify_signature(payload: &[u8], header: Option<&str>, app_secret: &str) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };
    match keyed_mac(payload, app_secret) {
        Some(mac) => mac.verify_slice(&expected).is_ok(),
        None => false,
    }
}

/// `sha256=<hex>` signature for `payload`, as the platform would send it.
pub fn sign(payload: &[u8], app_secret: &str) -> Option<String> {
    let mac = keyed_mac(payload, app_secret)?;
    Some(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn keyed_mac(payload: &[u8], app_secret: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"object":"page"}"#;
        let sig = sign(body, "secret").unwrap();
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature(body, Some(&sig), "secret"));
        assert!(!verify_signature(body, Some(&sig), "other"));
        assert!(!verify_signature(b"tampered", Some(&sig), "secret"));
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        let body = b"{}";
        assert!(!verify_signature(body, None, "secret"));
        assert!(!verify_signature(body, Some("md5=abc"), "secret"));
        assert!(!verify_signature(body, Some("sha256=zz"), "secret"));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = sign(b"The quick brown fox jumps over the lazy dog", "key").unwrap();
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[tokio::test]
    async fn test_send_without_token_is_false() {
        let m = GraphMessenger::new(&MessengerConfig::default(), None).unwrap();
        assert!(!m.send("psid", "hi").await);
    }
}
