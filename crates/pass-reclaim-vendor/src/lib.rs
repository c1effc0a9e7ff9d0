use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use pass_reclaim_core::{MatchMode, MemberId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("vendor endpoint not found (HTTP 404); check the configured base URL")]
    EndpointNotFound,
    #[error("vendor rejected credentials (HTTP {0})")]
    Credentials(u16),
    #[error("vendor returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport failure talking to vendor: {0}")]
    Transport(String),
    #[error("malformed vendor response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchFilter {
    pub name: String,
    pub mode: MatchMode,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberUpdate {
    pub id: MemberId,
    pub display_name: String,
    /// Metadata entries written alongside the name, e.g. the reclaim lock.
    pub meta: BTreeMap<String, String>,
}

/// The external membership directory, as consumed: one list-style search and
/// one record update. Everything else the vendor offers is out of scope.
pub trait MemberDirectory {
    /// # Errors
    /// Returns [`VendorError`] on transport, credential, endpoint, or
    /// malformed-body failures; zero hits is `Ok(vec![])`, never an error.
    fn search(&self, filter: &SearchFilter) -> Result<Vec<Value>, VendorError>;

    /// # Errors
    /// Returns [`VendorError`] when the update is rejected or unreachable.
    fn update(&self, update: &MemberUpdate) -> Result<Value, VendorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

/// Blocking HTTP directory client. One attempt per call; the vendor has
/// undocumented rate limits, so pacing belongs to [`Throttle`], not retries.
pub struct HttpMemberDirectory {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl HttpMemberDirectory {
    #[must_use]
    pub fn new(config: &DirectoryConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn call(&self, request: ureq::Request, body: &Value) -> Result<String, VendorError> {
        let response = request
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Accept", "application/json")
            .send_json(body.clone())
            .map_err(map_ureq_error)?;
        response.into_string().map_err(|err| VendorError::Transport(err.to_string()))
    }
}

fn map_ureq_error(err: ureq::Error) -> VendorError {
    match err {
        ureq::Error::Status(404, _) => VendorError::EndpointNotFound,
        ureq::Error::Status(status @ (401 | 403), _) => VendorError::Credentials(status),
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            VendorError::Http { status, body: truncate_detail(&body) }
        }
        ureq::Error::Transport(transport) => VendorError::Transport(transport.to_string()),
    }
}

impl MemberDirectory for HttpMemberDirectory {
    fn search(&self, filter: &SearchFilter) -> Result<Vec<Value>, VendorError> {
        let operator = match filter.mode {
            MatchMode::Exact => "eq",
            MatchMode::Substring => "contains",
        };
        let body = serde_json::json!({
            "filters": {
                "displayName": { "operator": operator, "value": filter.name }
            },
            "limit": filter.limit,
            "offset": filter.offset
        });
        let url = format!("{}/members/list", self.base_url);
        tracing::debug!(name = %filter.name, operator, limit = filter.limit, "member search");
        let text = self.call(self.agent.post(&url), &body)?;
        parse_search_body(&text)
    }

    fn update(&self, update: &MemberUpdate) -> Result<Value, VendorError> {
        let mut body = serde_json::json!({
            "id": update.id.as_str(),
            "person": { "displayName": update.display_name }
        });
        if !update.meta.is_empty() {
            let meta = serde_json::to_value(&update.meta)
                .map_err(|err| VendorError::Malformed(err.to_string()))?;
            body["meta"] = meta;
        }
        let url = format!("{}/members/member", self.base_url);
        tracing::debug!(id = %update.id, "member update");
        let text = self.call(self.agent.put(&url), &body)?;
        // A non-JSON 2xx body is tolerated: success with an opaque payload.
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}

/// Parse a search response body: a JSON array, or newline-delimited JSON
/// objects. Anything else is a hard error for the call, never an empty
/// result.
///
/// # Errors
/// Returns [`VendorError::Malformed`] when neither shape parses.
pub fn parse_search_body(body: &str) -> Result<Vec<Value>, VendorError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Array(items) => Ok(items),
            Value::Object(_) => Ok(vec![value]),
            _ => Err(VendorError::Malformed(
                "top-level JSON is neither an array nor an object".to_string(),
            )),
        };
    }

    let mut items = Vec::new();
    for (index, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => items.push(value),
            Ok(_) => {
                return Err(VendorError::Malformed(format!(
                    "NDJSON line {} is not a JSON object",
                    index + 1
                )))
            }
            Err(err) => {
                return Err(VendorError::Malformed(format!("NDJSON line {}: {err}", index + 1)))
            }
        }
    }
    Ok(items)
}

/// Cap an error body or detail string for operator display.
#[must_use]
pub fn truncate_detail(raw: &str) -> String {
    const MAX_CHARS: usize = 200;
    let mut out: String = raw.chars().take(MAX_CHARS).collect();
    if raw.chars().count() > MAX_CHARS {
        out.push_str("...");
    }
    out
}

/// Minimum-gap pacing between consecutive vendor calls.
#[derive(Debug)]
pub struct Throttle {
    min_gap: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    #[must_use]
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last_call: None }
    }

    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Sleep out the remainder of the gap since the previous call, then mark
    /// this call. The first call never sleeps.
    pub fn pause(&mut self) {
        if let Some(last_call) = self.last_call {
            let elapsed = last_call.elapsed();
            if elapsed < self.min_gap {
                std::thread::sleep(self.min_gap - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
    }
}
