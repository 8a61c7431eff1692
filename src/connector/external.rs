use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::governance::Content;
use crate::state::kinds::SourceType;
use crate::state::models::Blueprint;

/// Downloads External Connection blueprints from whitelisted domains.
pub struct ExternalFetcher {
    client: reqwest::Client,
    approved_domains: BTreeMap<String, String>,
}

impl ExternalFetcher {
    pub fn new(approved_domains: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            approved_domains,
        })
    }

    pub fn approved_domains(&self) -> impl Iterator<Item = &str> {
        self.approved_domains.keys().map(String::as_str)
    }

    /// Base URL of the blueprint's domain key joined with its specifier.
    pub fn resolve_url(&self, bp: &Blueprint) -> Result<String> {
        if bp.source_type != Some(SourceType::ExternalConnection) {
            return Err(RegistryError::validation(format!(
                "blueprint '{}' is not an external connection",
                bp.id
            )));
        }
        let key = bp.source_name.as_deref().unwrap_or_default();
        let base = self.approved_domains.get(key).ok_or_else(|| {
            RegistryError::permission(format!("domain '{}' is not on the approved list", key))
        })?;
        let specifier = bp.source_specifier.as_deref().unwrap_or_default();
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            specifier.trim_start_matches('/')
        ))
    }

    /// Fetches the blueprint's source. Non-2xx responses and timeouts are
    /// reported as [`RegistryError::Http`].
    pub async fn fetch(&self, bp: &Blueprint) -> Result<Content> {
        let url = self.resolve_url(bp)?;
        debug!(blueprint = %bp.id, url = %url, "fetching external source");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Http(format!("{} returned {}", url, status)));
        }
        let bytes = response.bytes().await?;
        info!(blueprint = %bp.id, bytes = bytes.len(), "external source fetched");

        Ok(Content::new(
            format!("{}{}", bp.id, bp.expected_extension),
            bytes.to_vec(),
        ))
    }
}
