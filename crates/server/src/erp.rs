//! External ledger posting. The HTTP poster is the only component with an
//! irreversible side effect; a timeout is an unknown outcome and is reported
//! as a failure, never an assumed success.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use apflow_core::config::ErpConfig;
use apflow_core::domain::item::ApItem;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ErpError {
    #[error("erp rejected the invoice: {0}")]
    Rejected(String),
    #[error("erp unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ErpPoster: Send + Sync {
    /// Post one invoice; returns the ERP document reference on success.
    async fn post_invoice(&self, item: &ApItem) -> Result<String, ErpError>;
}

pub struct HttpErpPoster {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct PostInvoiceResponse {
    reference: String,
}

impl HttpErpPoster {
    pub fn new(base_url: String, api_key: Option<SecretString>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { client, base_url, api_key }
    }

    pub fn from_config(config: &ErpConfig) -> Option<Self> {
        config
            .base_url
            .as_ref()
            .map(|base_url| Self::new(base_url.clone(), config.api_key.clone(), config.timeout_secs))
    }
}

#[async_trait]
impl ErpPoster for HttpErpPoster {
    async fn post_invoice(&self, item: &ApItem) -> Result<String, ErpError> {
        let url = format!("{}/api/invoices", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&json!({
            "external_id": item.id.0,
            "vendor_name": item.vendor_name,
            "amount": item.amount.to_string(),
            "currency": item.currency,
            "invoice_number": item.invoice_number,
            "due_date": item.due_date.map(|d| d.to_string()),
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| ErpError::Unavailable(error.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErpError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(ErpError::Unavailable(format!("erp returned {status}")));
        }

        let parsed: PostInvoiceResponse = response
            .json()
            .await
            .map_err(|error| ErpError::Unavailable(format!("malformed erp response: {error}")))?;
        Ok(parsed.reference)
    }
}

/// Local-development poster used when no ERP endpoint is configured.
#[derive(Clone, Debug, Default)]
pub struct NoopErpPoster;

#[async_trait]
impl ErpPoster for NoopErpPoster {
    async fn post_invoice(&self, _item: &ApItem) -> Result<String, ErpError> {
        Ok(format!("ERP-NOOP-{}", Uuid::new_v4()))
    }
}
