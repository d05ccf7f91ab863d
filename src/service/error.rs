use thiserror::Error;

use crate::error::HttpError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Gateway request failed: {0}")]
    GatewayRequest(#[from] reqwest::Error),

    #[error("Gateway rejected the request: {0}")]
    Gateway(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid fulfillment payload: {0}")]
    InvalidPayload(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::InvalidPayload(_) => HttpError::bad_request(error.to_string()),
            _ => HttpError::server_error(error.to_string()),
        }
    }
}

impl From<String> for ServiceError {
    fn from(err: String) -> Self {
        ServiceError::Other(err)
    }
}
