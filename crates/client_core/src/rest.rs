use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, Cursor},
    error::{ApiError, ErrorCode},
    protocol::{HistoryPage, Page, RosterPage},
};
use tracing::debug;
use url::Url;

use crate::{
    error::FetchError,
    history::{page_limit, HistoryApi},
    identity::{Identity, IdentityProvider},
    roster::RosterApi,
};

#[derive(Serialize)]
struct PageQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

/// Pull side of the backend: message history and the thread roster.
pub struct RestClient {
    http: Client,
    server_url: Url,
    identity: Arc<dyn IdentityProvider>,
}

impl RestClient {
    pub fn new(server_url: &str, identity: Arc<dyn IdentityProvider>) -> Result<Self, FetchError> {
        Ok(Self::with_http(
            Client::new(),
            Url::parse(server_url)?,
            identity,
        ))
    }

    pub fn with_http(http: Client, server_url: Url, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            http,
            server_url,
            identity,
        }
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        identity: &Identity,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<Page<T>, FetchError> {
        let limit = page_limit(limit)?;
        let url = endpoint(&self.server_url, segments)?;
        debug!(%url, limit, cursor = ?cursor, "fetching page");
        let request = self.http.get(url).query(&PageQuery {
            limit,
            cursor: cursor.map(Cursor::as_str),
        });
        let response = authorize(request, identity).send().await?;
        read_json(response).await
    }
}

#[async_trait]
impl HistoryApi for RestClient {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<HistoryPage, FetchError> {
        let identity = self.identity.identity();
        self.get_page(
            &["conversations", conversation_id.as_str(), "messages"],
            &identity,
            limit,
            cursor,
        )
        .await
    }
}

#[async_trait]
impl RosterApi for RestClient {
    async fn fetch_threads(
        &self,
        identity: &Identity,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<RosterPage, FetchError> {
        self.get_page(&["threads"], identity, limit, cursor).await
    }
}

fn authorize(request: RequestBuilder, identity: &Identity) -> RequestBuilder {
    match identity {
        Identity::User { credential } => request.bearer_auth(credential),
        Identity::Guest { guest_id } => request.query(&[("guestId", guest_id)]),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ApiError>(&body)
            .unwrap_or_else(|_| ApiError::new(error_code_for(status), body));
        return Err(FetchError::Rejected {
            status: status.as_u16(),
            source: error.into(),
        });
    }
    Ok(response.json().await?)
}

fn error_code_for(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        status if status.is_server_error() => ErrorCode::Internal,
        _ => ErrorCode::Unknown,
    }
}

/// Appends percent-encoded path segments to `base`.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, url::ParseError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
