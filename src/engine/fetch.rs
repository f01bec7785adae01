use std::time::Duration;
use serde_json::Value;
use crate::{Document, Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Controls how [`Arkivist::fetch`](crate::Arkivist::fetch) applies a remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Merge into the current content instead of replacing it.
    pub extend: bool,
    /// Propagate network and parse failures instead of logging them.
    pub strict: bool,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { extend: false, strict: false, timeout: DEFAULT_TIMEOUT }
    }
}

/// Performs a blocking GET and parses the body as a JSON object.
pub fn fetch_document(url: &str, timeout: Duration) -> Result<Document> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent = ureq::Agent::new_with_config(config);

    let mut response = agent.get(url).call().map_err(|e| Error::Fetch(e.to_string()))?;
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| Error::Fetch(format!("failed to read response: {}", e)))?;

    parse_body(&body)
}

fn parse_body(body: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Fetch("response is not a JSON object".to_string())),
        Err(e) => Err(Error::Fetch(format!("invalid JSON response: {}", e))),
    }
}
