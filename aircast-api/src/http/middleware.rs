// HTTP middleware helpers

use axum::http::{header, HeaderMap};

/// Extract the bearer token from the Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, &'static str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or("Missing Authorization header")?;
    let text = value
        .to_str()
        .map_err(|_| "Invalid Authorization header value")?;
    text.strip_prefix("Bearer ")
        .ok_or("Authorization header must start with 'Bearer '")
}
