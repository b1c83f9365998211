//! Queue message schemas, one per pipeline stage.
//!
//! Messages travel as UTF-8 JSON objects. Each stage decodes exactly the
//! schema of the queue it consumes and validates required fields up front,
//! so a malformed body is rejected before any side effect happens.
//!
//! Retry bounds live in the message as [`RequeueCount`]s:
//!
//! | Field | Bumped by | Ceiling |
//! |-------|-----------|---------|
//! | `submit_queued_count` | resubmission after a service anomaly | `max_submit_requeue_count` |
//! | `polling_queue_count` | poll requeue while the job is running | `max_polling_requeue_count` |
//! | `chunk_queued_count` | chunk requeue after HTTP 429 | `max_submit_requeue_count` |
//!
//! No downstream stage ever resets a counter it inherits.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;
use crate::models::DEFAULT_PROMPT_ID;

/// Attempt counter carried by a message. The first attempt is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequeueCount(u32);

impl RequeueCount {
    pub const FIRST: RequeueCount = RequeueCount(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether another requeue is allowed under `ceiling`.
    pub fn below(self, ceiling: u32) -> bool {
        self.0 < ceiling
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for RequeueCount {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for RequeueCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequeueCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

// Older producers stringified counters on fan-out, so accept "3" as well as 3.
impl<'de> Deserialize<'de> for RequeueCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CountVisitor;

        impl Visitor<'_> for CountVisitor {
            type Value = RequeueCount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative counter as a number or numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(RequeueCount)
                    .map_err(|_| E::custom(format!("counter out of range: {}", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(RequeueCount)
                    .map_err(|_| E::custom(format!("counter out of range: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.trim()
                    .parse::<u32>()
                    .map(RequeueCount)
                    .map_err(|_| E::custom(format!("invalid counter: '{}'", v)))
            }
        }

        deserializer.deserialize_any(CountVisitor)
    }
}

/// Which submit queue an upload is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileTrack {
    Pdf,
    NonPdf,
}

/// Extensions routed to the non-PDF submit queue.
pub const NON_PDF_EXTENSIONS: &[&str] = &[
    "htm", "csv", "doc", "docx", "eml", "html", "md", "msg", "ppt", "pptx", "txt", "xlsx", "xml",
    "json",
];

/// Lower-cased extension of the final path segment, if any.
pub fn file_extension(name: &str) -> Option<String> {
    let base = crate::models::base_name(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

impl FileTrack {
    /// Classify an upload by extension; `None` means unsupported.
    pub fn classify(name: &str) -> Option<FileTrack> {
        let ext = file_extension(name)?;
        if ext == "pdf" {
            Some(FileTrack::Pdf)
        } else if NON_PDF_EXTENSIONS.contains(&ext.as_str()) {
            Some(FileTrack::NonPdf)
        } else {
            None
        }
    }
}

fn default_prompt_id() -> String {
    DEFAULT_PROMPT_ID.to_string()
}

/// Stage 1 → submit queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitMessage {
    pub blob_name: String,
    pub blob_uri: String,
    pub submit_queued_count: RequeueCount,
    #[serde(default = "default_prompt_id")]
    pub prompt_id: String,
}

/// Submit → polling queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollMessage {
    pub blob_name: String,
    pub blob_uri: String,
    pub submit_queued_count: RequeueCount,
    #[serde(default = "default_prompt_id")]
    pub prompt_id: String,
    #[serde(rename = "FR_resultId")]
    pub result_id: String,
    /// Index of the endpoint the job was submitted to; fixed for all polls.
    #[serde(rename = "FR_API_List_idx")]
    pub endpoint_index: usize,
    pub polling_queue_count: RequeueCount,
}

/// Polling fan-out → chunk queue, one per merged chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub blob_name: String,
    pub blob_uri: String,
    pub submit_queued_count: RequeueCount,
    #[serde(default = "default_prompt_id")]
    pub prompt_id: String,
    #[serde(rename = "FR_resultId")]
    pub result_id: String,
    pub polling_queue_count: RequeueCount,
    pub chunk_name: String,
    pub chunk_blob_uri: String,
    pub chunk_queued_count: RequeueCount,
}

/// Any message the pipeline moves between queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    Submit(SubmitMessage),
    Poll(PollMessage),
    Chunk(ChunkMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Submit,
    Poll,
    Chunk,
}

impl PipelineMessage {
    /// Decode `body` as the schema `kind` and validate required fields.
    pub fn decode(kind: MessageKind, body: &str) -> Result<Self, PipelineError> {
        let message = match kind {
            MessageKind::Submit => PipelineMessage::Submit(serde_json::from_str(body)?),
            MessageKind::Poll => PipelineMessage::Poll(serde_json::from_str(body)?),
            MessageKind::Chunk => PipelineMessage::Chunk(serde_json::from_str(body)?),
        };
        message.validate()?;
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            PipelineMessage::Submit(_) => MessageKind::Submit,
            PipelineMessage::Poll(_) => MessageKind::Poll,
            PipelineMessage::Chunk(_) => MessageKind::Chunk,
        }
    }

    pub fn blob_name(&self) -> &str {
        match self {
            PipelineMessage::Submit(m) => &m.blob_name,
            PipelineMessage::Poll(m) => &m.blob_name,
            PipelineMessage::Chunk(m) => &m.blob_name,
        }
    }

    pub fn encode(&self) -> Result<String, PipelineError> {
        let body = match self {
            PipelineMessage::Submit(m) => serde_json::to_string(m)?,
            PipelineMessage::Poll(m) => serde_json::to_string(m)?,
            PipelineMessage::Chunk(m) => serde_json::to_string(m)?,
        };
        Ok(body)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let mut required: Vec<(&str, &str)> = Vec::new();
        match self {
            PipelineMessage::Submit(m) => {
                required.push(("blob_name", m.blob_name.as_str()));
                required.push(("blob_uri", m.blob_uri.as_str()));
            }
            PipelineMessage::Poll(m) => {
                required.push(("blob_name", m.blob_name.as_str()));
                required.push(("blob_uri", m.blob_uri.as_str()));
                required.push(("FR_resultId", m.result_id.as_str()));
            }
            PipelineMessage::Chunk(m) => {
                required.push(("blob_name", m.blob_name.as_str()));
                required.push(("blob_uri", m.blob_uri.as_str()));
                required.push(("chunk_name", m.chunk_name.as_str()));
                required.push(("chunk_blob_uri", m.chunk_blob_uri.as_str()));
            }
        }
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(PipelineError::MalformedMessage(format!(
                "required field '{}' is empty",
                field
            )));
        }
        Ok(())
    }
}

impl SubmitMessage {
    pub fn new(blob_name: &str, blob_uri: &str, prompt_id: &str) -> Self {
        Self {
            blob_name: blob_name.to_string(),
            blob_uri: blob_uri.to_string(),
            submit_queued_count: RequeueCount::FIRST,
            prompt_id: prompt_id.to_string(),
        }
    }

    /// Message for the polling queue once the job was accepted.
    pub fn into_poll(self, result_id: &str, endpoint_index: usize) -> PollMessage {
        PollMessage {
            blob_name: self.blob_name,
            blob_uri: self.blob_uri,
            submit_queued_count: self.submit_queued_count,
            prompt_id: self.prompt_id,
            result_id: result_id.to_string(),
            endpoint_index,
            polling_queue_count: RequeueCount::FIRST,
        }
    }

    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.submit_queued_count = self.submit_queued_count.next();
        next
    }
}

impl PollMessage {
    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.polling_queue_count = self.polling_queue_count.next();
        next
    }

    /// Submit message that restarts the job from scratch.
    pub fn resubmission(&self) -> SubmitMessage {
        SubmitMessage {
            blob_name: self.blob_name.clone(),
            blob_uri: self.blob_uri.clone(),
            submit_queued_count: self.submit_queued_count.next(),
            prompt_id: self.prompt_id.clone(),
        }
    }

    pub fn fan_out(&self, chunk_name: &str, chunk_blob_uri: &str) -> ChunkMessage {
        ChunkMessage {
            blob_name: self.blob_name.clone(),
            blob_uri: self.blob_uri.clone(),
            submit_queued_count: self.submit_queued_count,
            prompt_id: self.prompt_id.clone(),
            result_id: self.result_id.clone(),
            polling_queue_count: self.polling_queue_count,
            chunk_name: chunk_name.to_string(),
            chunk_blob_uri: chunk_blob_uri.to_string(),
            chunk_queued_count: RequeueCount::FIRST,
        }
    }
}

impl ChunkMessage {
    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.chunk_queued_count = self.chunk_queued_count.next();
        next
    }
}
