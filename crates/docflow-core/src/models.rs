//! Core data models persisted by the status and prompt stores.
//!
//! Every record carries a `doc_type` discriminator so that document logs,
//! chunk logs and LLM outputs can share one durable container. Identifiers
//! are produced by [`encode_id`], a URL-safe base64 encoding of the path or
//! chunk name. It is stable and collision-free but never decoded.
//!
//! State and classification enums are closed types in-process and map to
//! their persisted string form through a single `as_str` / `FromStr` pair,
//! which both serde and the SQL layer use.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `doc_type` of a [`DocumentStatusRecord`].
pub const DOC_TYPE_FILE_LOG: &str = "file_log";
/// `doc_type` of a [`ChunkLogRecord`].
pub const DOC_TYPE_CHUNK_LOG: &str = "chunk_log";
/// `doc_type` of an [`LlmOutputRecord`].
pub const DOC_TYPE_LLM_OUTPUT: &str = "llm_output";

/// Sentinel for chunk counts that the polling stage has not set yet.
pub const UNKNOWN_COUNT: i64 = -1;

/// Reserved user id and prompt id for the seeded default prompt.
pub const DEFAULT_USER_ID: &str = "default";
pub const DEFAULT_PROMPT_ID: &str = "default";

/// Text of the prompt seeded for the default user.
pub const DEFAULT_PROMPT_TEXT: &str = "Summarise the provided text below:";

/// Encode a document path or chunk name into a store-safe identifier.
pub fn encode_id(raw: &str) -> String {
    URL_SAFE.encode(raw.as_bytes())
}

/// Final path segment of a document path (`a/b/report.pdf` → `report.pdf`).
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum_serde {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Processing state of a document or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Processing,
    Skipped,
    Queued,
    Complete,
    Error,
    Throttled,
    Uploaded,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Processing,
        State::Skipped,
        State::Queued,
        State::Complete,
        State::Error,
        State::Throttled,
        State::Uploaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Processing => "Processing",
            State::Skipped => "Skipped",
            State::Queued => "Queued",
            State::Complete => "Complete",
            State::Error => "Error",
            State::Throttled => "Throttled",
            State::Uploaded => "Uploaded",
        }
    }
}

impl FromStr for State {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "state",
                value: s.to_string(),
            })
    }
}

string_enum_serde!(State);

/// Severity of a single status update entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClassification {
    Debug,
    Info,
    Error,
}

impl StatusClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusClassification::Debug => "Debug",
            StatusClassification::Info => "Info",
            StatusClassification::Error => "Error",
        }
    }
}

impl FromStr for StatusClassification {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Debug" => Ok(StatusClassification::Debug),
            "Info" => Ok(StatusClassification::Info),
            "Error" => Ok(StatusClassification::Error),
            other => Err(UnknownVariant {
                kind: "status classification",
                value: other.to_string(),
            }),
        }
    }
}

string_enum_serde!(StatusClassification);

/// How much of a record's history a status read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusQueryLevel {
    /// Debug entries are stripped.
    #[default]
    Concise,
    Verbose,
}

/// One entry of a document's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    pub status_timestamp: DateTime<Utc>,
    pub status_classification: StatusClassification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Per-document status log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatusRecord {
    pub id: String,
    pub doc_type: String,
    pub file_path: String,
    pub file_name: String,
    pub state: State,
    pub chunk_count: i64,
    pub merged_chunk_count: i64,
    pub start_timestamp: DateTime<Utc>,
    pub state_timestamp: DateTime<Utc>,
    pub state_description: String,
    pub status_updates: Vec<StatusUpdate>,
}

impl DocumentStatusRecord {
    /// Brand-new record with unknown chunk counts and a single history entry.
    pub fn new(document_path: &str, state: State, first_update: StatusUpdate) -> Self {
        let now = first_update.status_timestamp;
        Self {
            id: encode_id(document_path),
            doc_type: DOC_TYPE_FILE_LOG.to_string(),
            file_path: document_path.to_string(),
            file_name: base_name(document_path).to_string(),
            state,
            chunk_count: UNKNOWN_COUNT,
            merged_chunk_count: UNKNOWN_COUNT,
            start_timestamp: now,
            state_timestamp: now,
            state_description: String::new(),
            status_updates: vec![first_update],
        }
    }

    /// Move to `state`, stamping the time only on an actual change.
    pub fn apply_state(&mut self, state: State, now: DateTime<Utc>) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.state_timestamp = now;
        true
    }

    /// Drop Debug history entries for concise reads.
    pub fn filter_for(mut self, level: StatusQueryLevel) -> Self {
        if level == StatusQueryLevel::Concise {
            self.status_updates
                .retain(|u| u.status_classification != StatusClassification::Debug);
        }
        self
    }

    pub fn fan_out_known(&self) -> bool {
        self.merged_chunk_count != UNKNOWN_COUNT
    }
}

/// Latest state of one merged chunk. Overwritten on every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLogRecord {
    pub id: String,
    pub doc_type: String,
    pub file_path: String,
    pub file_name: String,
    pub chunk_name: String,
    pub chunk_blob_uri: String,
    pub chunk_state: State,
    pub state_timestamp: DateTime<Utc>,
    pub additional_info: String,
}

impl ChunkLogRecord {
    pub fn new(
        file_path: &str,
        chunk_blob_uri: &str,
        chunk_name: &str,
        chunk_state: State,
        info: &str,
    ) -> Self {
        Self {
            id: encode_id(chunk_name),
            doc_type: DOC_TYPE_CHUNK_LOG.to_string(),
            file_path: file_path.to_string(),
            file_name: base_name(file_path).to_string(),
            chunk_name: chunk_name.to_string(),
            chunk_blob_uri: chunk_blob_uri.to_string(),
            chunk_state,
            state_timestamp: Utc::now(),
            additional_info: info.to_string(),
        }
    }
}

/// Token usage reported by the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub completion_tokens: i64,
    pub prompt_tokens: i64,
    pub total_tokens: i64,
}

/// Output of one successfully completed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmOutputRecord {
    pub id: String,
    pub doc_type: String,
    pub file_path: String,
    pub file_name: String,
    pub chunk_name: String,
    pub chunk_blob_uri: String,
    pub llm_output: String,
    pub llm_output_file: String,
    pub user_id: String,
    pub prompt_id: String,
    pub usage: TokenUsage,
    pub state_timestamp: DateTime<Utc>,
}

/// Inputs for [`LlmOutputRecord::new`], grouped to keep call sites readable.
#[derive(Debug, Clone)]
pub struct LlmOutputEntry<'a> {
    pub file_path: &'a str,
    pub chunk_blob_uri: &'a str,
    pub chunk_name: &'a str,
    pub llm_output: &'a str,
    pub llm_output_file: &'a str,
    pub user_id: &'a str,
    pub prompt_id: &'a str,
    pub usage: TokenUsage,
}

impl LlmOutputRecord {
    pub fn new(entry: &LlmOutputEntry<'_>) -> Self {
        Self {
            id: encode_id(entry.llm_output_file),
            doc_type: DOC_TYPE_LLM_OUTPUT.to_string(),
            file_path: entry.file_path.to_string(),
            file_name: base_name(entry.file_path).to_string(),
            chunk_name: entry.chunk_name.to_string(),
            chunk_blob_uri: entry.chunk_blob_uri.to_string(),
            llm_output: entry.llm_output.to_string(),
            llm_output_file: entry.llm_output_file.to_string(),
            user_id: entry.user_id.to_string(),
            prompt_id: entry.prompt_id.to_string(),
            usage: entry.usage,
            state_timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub prompt_id: String,
    pub prompt: String,
}

/// All prompts owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    pub user_id: String,
    pub prompts: Vec<PromptEntry>,
    pub timestamp: DateTime<Utc>,
}

impl PromptRecord {
    pub fn new(user_id: &str, prompts: Vec<PromptEntry>) -> Self {
        Self {
            id: encode_id(user_id),
            user_id: user_id.to_string(),
            prompts,
            timestamp: Utc::now(),
        }
    }

    /// The record seeded on first store creation.
    pub fn seeded_default() -> Self {
        Self::new(
            DEFAULT_USER_ID,
            vec![PromptEntry {
                prompt_id: DEFAULT_PROMPT_ID.to_string(),
                prompt: DEFAULT_PROMPT_TEXT.to_string(),
            }],
        )
    }

    pub fn find(&self, prompt_id: &str) -> Option<&str> {
        self.prompts
            .iter()
            .find(|p| p.prompt_id == prompt_id)
            .map(|p| p.prompt.as_str())
    }

    /// Insert or replace a prompt by id.
    pub fn set(&mut self, prompt_id: &str, prompt: &str) {
        match self.prompts.iter_mut().find(|p| p.prompt_id == prompt_id) {
            Some(entry) => entry.prompt = prompt.to_string(),
            None => self.prompts.push(PromptEntry {
                prompt_id: prompt_id.to_string(),
                prompt: prompt.to_string(),
            }),
        }
        self.timestamp = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_mapping_round_trips() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("complete".parse::<State>().is_err());
        assert!("All".parse::<State>().is_err());
    }

    #[test]
    fn test_persisted_state_strings_are_stable() {
        assert_eq!(State::Processing.as_str(), "Processing");
        assert_eq!(State::Complete.as_str(), "Complete");
        assert_eq!(State::Throttled.as_str(), "Throttled");
        assert_eq!(StatusClassification::Debug.as_str(), "Debug");
    }

    #[test]
    fn test_encode_id_is_url_safe_and_distinct() {
        let a = encode_id("upload/alice/report.pdf");
        let b = encode_id("upload/alice/report.pdf-merged-0.json");
        assert_ne!(a, b);
        assert!(!a.contains('/') && !a.contains('+'));
        assert_eq!(a, encode_id("upload/alice/report.pdf"));
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("alice/2024/report.pdf"), "report.pdf");
        assert_eq!(base_name("report.pdf"), "report.pdf");
    }

    #[test]
    fn test_concise_filter_drops_debug_only() {
        let now = Utc::now();
        let mut record = DocumentStatusRecord::new(
            "a/b.pdf",
            State::Processing,
            StatusUpdate {
                status: "started".into(),
                status_timestamp: now,
                status_classification: StatusClassification::Info,
                stack_trace: None,
            },
        );
        record.status_updates.push(StatusUpdate {
            status: "noise".into(),
            status_timestamp: now,
            status_classification: StatusClassification::Debug,
            stack_trace: None,
        });
        let concise = record.clone().filter_for(StatusQueryLevel::Concise);
        assert_eq!(concise.status_updates.len(), 1);
        let verbose = record.filter_for(StatusQueryLevel::Verbose);
        assert_eq!(verbose.status_updates.len(), 2);
    }

    #[test]
    fn test_prompt_record_set_replaces_existing() {
        let mut record = PromptRecord::seeded_default();
        assert_eq!(record.find("default"), Some(DEFAULT_PROMPT_TEXT));
        record.set("default", "Bullet points please:");
        record.set("short", "One line:");
        assert_eq!(record.prompts.len(), 2);
        assert_eq!(record.find("default"), Some("Bullet points please:"));
        assert_eq!(record.find("missing"), None);
    }
}
