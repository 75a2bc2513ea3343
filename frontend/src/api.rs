use gloo_net::http::Request;
use serde_json::Value;
use voice_session::{EndpointResolver, StreamingStatus};

/// Fetches the product-info streaming status.
pub async fn fetch_product_info_status(resolver: &EndpointResolver) -> Result<StreamingStatus, String> {
    let url = resolver
        .resolve_http_url("/product-info-status")
        .map_err(|e| e.to_string())?;
    let resp = Request::get(url.as_str())
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(format!("Server error: {}", resp.status()));
    }

    let body = resp
        .json::<Value>()
        .await
        .map_err(|e| format!("Parse error: {e}"))?;
    StreamingStatus::from_json(body).map_err(|e| format!("Parse error: {e}"))
}

/// Asks the backend to drop the external product-info stream.
pub async fn reset_product_info(resolver: &EndpointResolver) -> Result<(), String> {
    let url = resolver
        .resolve_http_url("/product-info-reset")
        .map_err(|e| e.to_string())?;
    let resp = Request::post(url.as_str())
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(format!("Server error: {}", resp.status()));
    }
    Ok(())
}
