use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};
use voice_session::{EndpointResolver, StreamingStatus};

use crate::errors::{ApiError, AppError};

pub const BOOTSTRAP_PATH: &str = "/connect";
pub const PRODUCT_INFO_STATUS_PATH: &str = "/product-info-status";
pub const PRODUCT_INFO_RESET_PATH: &str = "/product-info-reset";

/// HTTP side of the backend: bootstrap, product-info status and reset.
#[derive(Clone)]
pub struct BackendApi {
    http: Client,
    resolver: EndpointResolver,
}

impl BackendApi {
    pub fn new(resolver: EndpointResolver) -> Self {
        Self { http: Client::new(), resolver }
    }

    /// Fetches the bootstrap document (the transport parameters the backend advertises).
    pub async fn bootstrap(&self) -> Result<Value, AppError> {
        let url = self.resolver.resolve_http_url(BOOTSTRAP_PATH)?;
        let body = self.get_json(url.as_str()).await?;
        debug!(%url, "Fetched bootstrap parameters");
        Ok(body)
    }

    pub async fn product_info_status(&self) -> Result<StreamingStatus, AppError> {
        let url = self.resolver.resolve_http_url(PRODUCT_INFO_STATUS_PATH)?;
        let body = self.get_json(url.as_str()).await?;
        StreamingStatus::from_json(body).map_err(|e| {
            AppError::from(ApiError::Decode { url: url.to_string(), message: e.to_string() })
        })
    }

    /// Asks the backend to drop the external product-info stream.
    pub async fn reset_product_info(&self) -> Result<(), AppError> {
        let url = self.resolver.resolve_http_url(PRODUCT_INFO_RESET_PATH)?;
        let resp = self
            .http
            .post(url.as_str())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ApiError::request(url.as_str(), e))?;

        if !resp.status().is_success() {
            return Err(ApiError::Status { url: url.to_string(), status: resp.status().as_u16() }.into());
        }
        info!(%url, "Product info stream reset");
        Ok(())
    }

    async fn get_json(&self, url: &str) -> Result<Value, ApiError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ApiError::request(url, e))?;

        if !resp.status().is_success() {
            return Err(ApiError::Status { url: url.to_string(), status: resp.status().as_u16() });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ApiError::Decode { url: url.to_string(), message: e.to_string() })
    }
}
