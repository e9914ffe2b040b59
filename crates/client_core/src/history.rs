use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::ConversationId,
    error::ApiError,
    protocol::{ApiResponse, ConversationList, HistoryPage, PageRequest},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::HistoryError;

/// Source of conversation listings and history pages.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn list_conversations(&self) -> Result<ConversationList, HistoryError>;
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        request: &PageRequest,
    ) -> Result<HistoryPage, HistoryError>;
}

/// Called when a REST collaborator rejects the session's credentials.
pub trait AuthFailureHandler: Send + Sync {
    fn on_unauthorized(&self);
}

pub struct IgnoreAuthFailures;

impl AuthFailureHandler for IgnoreAuthFailures {
    fn on_unauthorized(&self) {}
}

impl<F> AuthFailureHandler for F
where
    F: Fn() + Send + Sync,
{
    fn on_unauthorized(&self) {
        self()
    }
}

pub struct RestHistoryClient {
    http: Client,
    base_url: String,
    auth: Arc<dyn AuthFailureHandler>,
}

impl RestHistoryClient {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn AuthFailureHandler>,
    ) -> Result<Self, HistoryError> {
        Self::with_client(Client::new(), base_url, auth)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        auth: Arc<dyn AuthFailureHandler>,
    ) -> Result<Self, HistoryError> {
        let base_url = base_url.into();
        Url::parse(&base_url)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    async fn get_data<T>(
        &self,
        path: &str,
        query: Option<&PageRequest>,
    ) -> Result<Option<T>, HistoryError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.get(&url);
        if let Some(query) = query {
            request = request.query(query);
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            debug!(%url, "history: no content");
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED {
            warn!(%url, "history: session rejected");
            self.auth.on_unauthorized();
        }
        if !status.is_success() {
            let message = response
                .json::<ApiResponse<Value>>()
                .await
                .ok()
                .and_then(|body| body.error);
            return Err(ApiError::from_status(status.as_u16(), message).into());
        }

        let body: ApiResponse<T> = response.json().await?;
        Ok(body.data)
    }
}

#[async_trait]
impl HistorySource for RestHistoryClient {
    async fn list_conversations(&self) -> Result<ConversationList, HistoryError> {
        let conversations: Option<ConversationList> = self.get_data("/conversations", None).await?;
        Ok(conversations.unwrap_or_default())
    }

    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        request: &PageRequest,
    ) -> Result<HistoryPage, HistoryError> {
        let path = format!("/conversations/{}/messages", conversation_id.as_str());
        let page: Option<HistoryPage> = self.get_data(&path, Some(request)).await?;
        Ok(page.unwrap_or_default())
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
