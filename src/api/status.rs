//! Maps backend status codes onto [`DataError`] variants.

use reqwest::StatusCode;

use super::types::RawResponse;
use crate::error::{DataError, Result, RetryGuidance};

/// Pass through 2xx and 304 responses, turn everything else into a typed error.
pub fn classify(response: RawResponse) -> Result<RawResponse> {
  let status = response.status;
  if status.is_success() || status == StatusCode::NOT_MODIFIED {
    return Ok(response);
  }

  Err(match status {
    StatusCode::UNAUTHORIZED => DataError::AuthExpired,
    StatusCode::TOO_MANY_REQUESTS => {
      DataError::RateLimited(RetryGuidance::from_headers(&response.headers))
    }
    s if s.is_server_error() => DataError::Server(s),
    s => DataError::Http {
      status: s,
      body: String::from_utf8_lossy(&response.body).into_owned(),
    },
  })
}

/// Deserialize a JSON body from a successful response.
pub fn json<T: serde::de::DeserializeOwned>(response: &RawResponse) -> Result<T> {
  serde_json::from_slice(&response.body).map_err(DataError::from)
}
