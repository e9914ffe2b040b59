use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation {0} is not joined")]
    NotJoined(ConversationId),
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("no conversation selected")]
    NoActiveConversation,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("history request rejected: {0}")]
    Api(#[from] ApiError),
    #[error("invalid history url: {0}")]
    Url(#[from] url::ParseError),
}

impl HistoryError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HistoryError::Api(err) if err.is_unauthorized())
    }
}
