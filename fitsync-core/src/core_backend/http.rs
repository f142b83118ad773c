//! HTTP implementation of [`GroupApi`]

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{ApiError, ApiResult, CreateGroupRequest, GroupApi, RawIdentifierTable};
use crate::config::ServerConfig;
use crate::core_groups::types::{Group, GroupId, GroupPatch, Membership};

/// Error body shape returned by the backend
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// REST client for the server of record
#[derive(Clone)]
pub struct HttpGroupApi {
    client: Client,
    base_url: String,
}

impl HttpGroupApi {
    /// Build a client with the configured per-request timeout
    pub fn new(config: &ServerConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        trace!(%method, %url, "Backend request");
        self.client.request(method, url)
    }

    async fn check(response: Response) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| if body.is_empty() { status.to_string() } else { body });
        debug!(status = status.as_u16(), %message, "Backend returned an error");
        Err(ApiError::Http { status: status.as_u16(), message })
    }

    async fn json<T: DeserializeOwned>(builder: RequestBuilder) -> ApiResult<T> {
        let response = Self::check(builder.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn empty(builder: RequestBuilder) -> ApiResult<()> {
        Self::check(builder.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl GroupApi for HttpGroupApi {
    async fn list_groups(&self) -> ApiResult<Vec<Group>> {
        Self::json(self.request(Method::GET, "/groups")).await
    }

    async fn list_members(&self, group_id: GroupId) -> ApiResult<Vec<Membership>> {
        Self::json(self.request(Method::GET, &format!("/groups/{}/members", group_id))).await
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> ApiResult<Group> {
        Self::json(self.request(Method::POST, "/groups").json(request)).await
    }

    async fn update_group(&self, group_id: GroupId, patch: &GroupPatch) -> ApiResult<Group> {
        Self::json(self.request(Method::PATCH, &format!("/groups/{}", group_id)).json(patch)).await
    }

    async fn delete_group(&self, group_id: GroupId) -> ApiResult<()> {
        Self::empty(self.request(Method::DELETE, &format!("/groups/{}", group_id))).await
    }

    async fn fetch_identifiers(&self) -> ApiResult<RawIdentifierTable> {
        Self::json(self.request(Method::GET, "/group-ids")).await
    }

    async fn delete_identifier(&self, group_id: GroupId) -> ApiResult<()> {
        Self::empty(self.request(Method::DELETE, &format!("/group-ids/{}", group_id))).await
    }

    async fn reset_identifiers(&self) -> ApiResult<RawIdentifierTable> {
        Self::json(self.request(Method::POST, "/group-ids/reset")).await
    }
}
