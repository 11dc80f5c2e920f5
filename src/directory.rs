//! User directory: resolves author ids to display names.
//!
//! Names are side-channel metadata. The router never waits on a lookup; the
//! session runs them in the background and feeds results back to the core.

#[cfg(test)]
#[path = "directory_test.rs"]
mod directory_test;

use serde::Deserialize;

use crate::config::SyncConfig;
use crate::element::UserId;
use crate::persistence::{StoreError, auth_headers, classify_failure};

/// Display-name lookup. Enables mocking in tests.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// The user's display name, or `None` if the user has neither a
    /// display name nor an email on file.
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, StoreError>;
}

/// One row of the profiles table, reduced to what naming needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Profile {
    /// Display name if set, else the local part of the email.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        if let Some(name) = self.display_name.as_deref().map(str::trim)
            && !name.is_empty()
        {
            return Some(name.to_owned());
        }
        let email = self.email.as_deref()?;
        let local = email.split('@').next().unwrap_or_default().trim();
        (!local.is_empty()).then(|| local.to_owned())
    }
}

const PROFILES_PATH: &str = "/rest/v1/profiles";

/// `UserDirectory` over the PostgREST profiles table.
#[derive(Clone)]
pub struct RestDirectory {
    http: reqwest::Client,
    base_url: String,
}

impl RestDirectory {
    /// # Errors
    ///
    /// Returns an error if a credential isn't a valid header value or the
    /// HTTP client can't be built.
    pub fn new(config: &SyncConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .default_headers(auth_headers(config)?)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, base_url: config.api_url.trim_end_matches('/').to_owned() })
    }
}

#[async_trait::async_trait]
impl UserDirectory for RestDirectory {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        let response = self
            .http
            .get(format!("{}{PROFILES_PATH}", self.base_url))
            .query(&[("id", format!("eq.{user_id}")), ("select", "display_name,email".to_owned())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, user_id, &body));
        }
        let rows: Vec<Profile> = serde_json::from_str(&body)?;
        Ok(rows.first().and_then(Profile::name))
    }
}
