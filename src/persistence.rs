//! Persistence store: the canonical home of board elements.
//!
//! DESIGN
//! ======
//! The sync engine only ever talks to persistence through the
//! `PersistenceStore` trait so the pipeline can be driven by an in-memory
//! store in tests. `RestStore` is the production implementation over a
//! PostgREST-style HTTP API (`/rest/v1/board_elements`).
//!
//! ERROR HANDLING
//! ==============
//! Errors distinguish "the optimistic edit was invalid" (`NotFound`,
//! `Forbidden`) from everything else. The pipeline removes the element
//! locally for the former and reloads the whole board for the latter.

#[cfg(test)]
#[path = "persistence_test.rs"]
mod persistence_test;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::debug;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::element::{BoardId, Element, ElementId, ElementPatch, NewElement};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("element not found: {0}")]
    NotFound(ElementId),
    #[error("not permitted to modify element: {0}")]
    Forbidden(ElementId),
    #[error("persistence request failed: {0}")]
    Transient(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl StoreError {
    /// Whether the error means the optimistic local state was invalid
    /// (element gone or not ours to change) rather than a transient failure.
    #[must_use]
    pub fn is_invalidating(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Forbidden(_))
    }
}

// =============================================================================
// PERSISTENCE TRAIT
// =============================================================================

/// Canonical element storage. Enables mocking in tests.
#[async_trait::async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert a new element. The store assigns its id and timestamps.
    async fn create(&self, element: &NewElement) -> Result<Element, StoreError>;

    /// Apply a sparse update and return the resulting row.
    async fn update(&self, id: ElementId, patch: &ElementPatch) -> Result<Element, StoreError>;

    /// Delete an element.
    async fn delete(&self, id: ElementId) -> Result<(), StoreError>;

    /// All elements of a board in creation order.
    async fn list(&self, board_id: BoardId) -> Result<Vec<Element>, StoreError>;
}

// =============================================================================
// REST STORE
// =============================================================================

const ELEMENTS_PATH: &str = "/rest/v1/board_elements";

/// PostgREST error code for "no rows returned" on a single-row request.
const PGRST_NO_ROWS: &str = "PGRST116";

/// `PersistenceStore` over a PostgREST-style HTTP API.
#[derive(Clone)]
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
}

impl RestStore {
    /// Build a store from configuration. The API key is sent as `apikey`
    /// and the access token (or the key) as the bearer credential.
    ///
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

    fn elements_url(&self) -> String {
        format!("{}{ELEMENTS_PATH}", self.base_url)
    }
}

/// Default headers shared by every REST collaborator.
pub(crate) fn auth_headers(config: &SyncConfig) -> Result<HeaderMap, StoreError> {
    let mut headers = HeaderMap::new();
    headers.insert("apikey", HeaderValue::from_str(&config.api_key)?);
    let bearer = config.access_token.as_deref().unwrap_or(&config.api_key);
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {bearer}"))?);
    Ok(headers)
}

#[async_trait::async_trait]
impl PersistenceStore for RestStore {
    async fn create(&self, element: &NewElement) -> Result<Element, StoreError> {
        let response = self
            .http
            .post(self.elements_url())
            .header("Prefer", "return=representation")
            .json(element)
            .send()
            .await?;
        // No id exists until the insert succeeds.
        let rows = read_rows(response, Uuid::nil()).await?;
        single_row(rows, Uuid::nil())
    }

    async fn update(&self, id: ElementId, patch: &ElementPatch) -> Result<Element, StoreError> {
        let response = self
            .http
            .patch(self.elements_url())
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        let rows = read_rows(response, id).await?;
        single_row(rows, id)
    }

    async fn delete(&self, id: ElementId) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.elements_url())
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows = read_rows(response, id).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list(&self, board_id: BoardId) -> Result<Vec<Element>, StoreError> {
        let response = self
            .http
            .get(self.elements_url())
            .query(&[
                ("board_id", format!("eq.{board_id}")),
                ("select", "*".to_owned()),
                ("order", "created_at.asc".to_owned()),
            ])
            .send()
            .await?;
        read_rows(response, Uuid::nil()).await
    }
}

async fn read_rows(response: reqwest::Response, id: ElementId) -> Result<Vec<Element>, StoreError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        debug!(%status, %id, "persistence request rejected");
        return Err(classify_failure(status, id, &body));
    }
    Ok(serde_json::from_str(&body)?)
}

fn single_row(rows: Vec<Element>, id: ElementId) -> Result<Element, StoreError> {
    rows.into_iter().next().ok_or(StoreError::NotFound(id))
}

/// Map a non-success response onto the error taxonomy.
pub(crate) fn classify_failure(status: StatusCode, id: ElementId, body: &str) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Forbidden(id),
        StatusCode::NOT_ACCEPTABLE if body.contains(PGRST_NO_ROWS) => StoreError::NotFound(id),
        _ => StoreError::Transient(format!("{status}: {}", body.trim())),
    }
}
