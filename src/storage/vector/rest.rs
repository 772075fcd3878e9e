//! Shared HTTP plumbing for the REST-backed drivers.

use crate::models::TagCollection;
use crate::{Error, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Per-request timeout applied to every REST driver call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the HTTP client shared by a driver instance.
pub fn build_client(operation: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Configuration(format!("{operation}: {e}")))
}

/// Maps a transport-level failure.
pub fn transport_error(operation: &str, e: &reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::connection(operation, e)
    } else {
        Error::operation(operation, e)
    }
}

/// Sends a request and returns the response if its status is a success.
///
/// `classify` gets the first look at a failed status and body; whatever it
/// declines becomes [`Error::ConnectionFailure`] for authentication and
/// gateway errors and [`Error::OperationFailed`] otherwise.
pub async fn send<F>(operation: &str, request: RequestBuilder, classify: F) -> Result<Response>
where
    F: FnOnce(StatusCode, &str) -> Option<Error> + Send,
{
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(operation, &e))?;
    check(operation, response, classify).await
}

/// Like [`send`], but a response with one of the `absent` statuses yields
/// `Ok(None)` instead of an error.
pub async fn send_optional(
    operation: &str,
    request: RequestBuilder,
    absent: &[StatusCode],
) -> Result<Option<Response>> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(operation, &e))?;
    if absent.contains(&response.status()) {
        return Ok(None);
    }
    check(operation, response, |_, _| None).await.map(Some)
}

async fn check<F>(operation: &str, response: Response, classify: F) -> Result<Response>
where
    F: FnOnce(StatusCode, &str) -> Option<Error> + Send,
{
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Some(error) = classify(status, &body) {
        return Err(error);
    }

    let cause = format!("status {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Err(Error::connection(operation, cause)),
        _ => Err(Error::operation(operation, cause)),
    }
}

/// Decodes a JSON response body.
pub async fn json<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::operation(format!("{operation}_decode"), e))
}

/// Joins `key:value` for backends that store tags as flat strings.
pub fn encode_tag(key: &str, value: &str) -> String {
    format!("{key}:{value}")
}

/// Rejects tag keys that cannot round-trip through the flat encoding.
pub fn ensure_flat_tags(tags: &TagCollection) -> Result<()> {
    match tags.iter().find(|(key, _)| key.contains(':')) {
        Some((key, _)) => Err(Error::InvalidInput(format!(
            "tag key '{key}' must not contain ':'"
        ))),
        None => Ok(()),
    }
}

/// Splits a flat `key:value` tag at the first separator.
pub fn decode_tag(tag: &str) -> Option<(&str, &str)> {
    tag.split_once(':')
}
