//! Transcript payloads produced by the merge stage.

use serde::{Deserialize, Serialize};

/// A word with timing, present when word timestamps were requested or
/// natively emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub start: f64,
    pub end: f64,
    pub word: String,
}

/// A contiguous span of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<Word>,
}

/// The merged final transcript stored as a job's result blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: f64,
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Concatenate segment texts into the flat `text` field.
    pub fn from_segments(language: Option<String>, segments: Vec<Segment>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let duration = segments.last().map(|s| s.end).unwrap_or(0.0);
        Self {
            text,
            language,
            duration,
            segments,
        }
    }
}
