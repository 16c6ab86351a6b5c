//! Client for the external abuse attestation service.
//!
//! New chats may only be created by users the service vouches for. The call
//! is bounded by a timeout and fails closed.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::ValidationError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttestationRequest {
    challenge_id: &'static str,
    challenge_specifier: &'static str,
    amount: u64,
}

const CHALLENGE: AttestationRequest = AttestationRequest {
    challenge_id: "x",
    challenge_specifier: "x",
    amount: 0,
};

#[derive(Debug, Clone)]
pub enum AbuseOracle {
    Http {
        client: reqwest::Client,
        base_url: String,
    },
    /// No service configured; every sender passes.
    Disabled,
}

impl AbuseOracle {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let Some(base_url) = base_url else {
            info!("AAO_SERVER not set, abuse attestation disabled");
            return Ok(AbuseOracle::Disabled);
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(AbuseOracle::Http {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Ask the service whether the user behind `handle` may open chats.
    pub async fn attest(&self, handle: &str) -> Result<(), ValidationError> {
        let AbuseOracle::Http { client, base_url } = self else {
            return Ok(());
        };

        let url = format!("{base_url}/attestation/{handle}");
        let resp = client.post(&url).json(&CHALLENGE).send().await.map_err(|e| {
            error!(error = %e, handle, "Error checking user attestation");
            ValidationError::AttestationFailed(if e.is_timeout() {
                "attestation timed out".to_string()
            } else {
                "attestation unavailable".to_string()
            })
        })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(handle, status = status.as_u16(), aao_server = %base_url, "User failed AAO check");
            return Err(ValidationError::AttestationFailed(format!(
                "attestation returned {status}"
            )));
        }
        Ok(())
    }
}
