//! Client for the remote analysis and summarization service.
//!
//! The service translates selected text into `{ en, zh }` pairs and writes
//! summaries of whole documents. Its analysis endpoint is loose about its
//! output: it may answer with a JSON list, with a JSON string holding that
//! list (sometimes inside a markdown code fence), or with something else
//! entirely. [`decode_analysis`] absorbs all of these.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

/// Upper bound on the text uploaded for summarization, in characters.
pub const MAX_SUMMARY_CHARS: usize = 30_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum RemoteServiceError {
    #[error("analysis service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("analysis service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response from analysis service: {0}")]
    Decode(String),
}

impl RemoteServiceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteServiceError::Transport(_) => true,
            RemoteServiceError::Status { status, .. } => *status >= 500 || *status == 429,
            RemoteServiceError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzeMode {
    #[default]
    Sentence,
    Paragraph,
}

impl FromStr for AnalyzeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sentence" => Ok(AnalyzeMode::Sentence),
            "paragraph" => Ok(AnalyzeMode::Paragraph),
            other => Err(format!("unknown analysis mode `{other}`")),
        }
    }
}

impl fmt::Display for AnalyzeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyzeMode::Sentence => f.write_str("sentence"),
            AnalyzeMode::Paragraph => f.write_str("paragraph"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationPair {
    pub en: String,
    pub zh: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Pairs(Vec<TranslationPair>),
    /// Anything the service produced that is not a list of pairs.
    Raw(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Translations only.
    Chinese,
    /// `[EN]`/`[ZH]` blocks.
    Bilingual,
}

impl Analysis {
    pub fn pairs(&self) -> &[TranslationPair] {
        match self {
            Analysis::Pairs(pairs) => pairs,
            Analysis::Raw(_) => &[],
        }
    }

    /// Plain-text export; `None` when there are no pairs to export.
    pub fn export(&self, format: ExportFormat) -> Option<String> {
        let Analysis::Pairs(pairs) = self else {
            return None;
        };
        let blocks: Vec<String> = pairs
            .iter()
            .map(|pair| match format {
                ExportFormat::Chinese => pair.zh.clone(),
                ExportFormat::Bilingual => format!("[EN] {}\n[ZH] {}", pair.en, pair.zh),
            })
            .collect();
        Some(blocks.join("\n\n"))
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}

pub fn decode_analysis(value: Value) -> Analysis {
    let value = match value {
        Value::String(raw) => match serde_json::from_str::<Value>(strip_code_fence(&raw)) {
            Ok(inner) => inner,
            Err(err) => {
                warn!(%err, "analysis payload is not JSON, keeping raw text");
                Value::String(raw)
            }
        },
        other => other,
    };

    match serde_json::from_value::<Vec<TranslationPair>>(value.clone()) {
        Ok(pairs) => Analysis::Pairs(pairs),
        Err(_) => Analysis::Raw(value),
    }
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
    mode: AnalyzeMode,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    text: &'a str,
    length: u32,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: String,
}

pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: String,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteServiceError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http_client(base_url, http))
    }

    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    #[instrument(skip(self, text), fields(chars = text.chars().count()))]
    pub async fn analyze(&self, text: &str, mode: AnalyzeMode) -> Result<Analysis, RemoteServiceError> {
        info!("requesting text analysis");
        let response = self
            .http
            .post(self.endpoint("/api/analyze"))
            .json(&AnalyzeRequest { text, mode })
            .send()
            .await?;
        let value: Value = checked(response)
            .await?
            .json()
            .await
            .map_err(|err| RemoteServiceError::Decode(err.to_string()))?;
        Ok(decode_analysis(value))
    }

    #[instrument(skip(self, text), fields(chars = text.chars().count()))]
    pub async fn summarize(&self, text: &str, length: u32) -> Result<String, RemoteServiceError> {
        info!("requesting summary");
        let text = truncate_chars(text, MAX_SUMMARY_CHARS);
        let response = self
            .http
            .post(self.endpoint("/api/summarize"))
            .json(&SummarizeRequest { text, length })
            .send()
            .await?;
        let body: SummarizeResponse = checked(response)
            .await?
            .json()
            .await
            .map_err(|err| RemoteServiceError::Decode(err.to_string()))?;
        Ok(body.summary)
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, RemoteServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteServiceError::Status {
        status: status.as_u16(),
        body,
    })
}
