//! Minimal transcript renderers backing the export endpoint.

use crate::model::Transcript;

/// Formats the export endpoint can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Srt,
    Vtt,
    Txt,
    Json,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "srt" => Some(ExportFormat::Srt),
            "vtt" => Some(ExportFormat::Vtt),
            "txt" => Some(ExportFormat::Txt),
            "json" => Some(ExportFormat::Json),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Vtt => "text/vtt",
            _ => "text/plain; charset=utf-8",
        }
    }
}

/// Render a transcript in the requested format.
pub fn render(transcript: &Transcript, format: ExportFormat) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Srt => Ok(to_srt(transcript)),
        ExportFormat::Vtt => Ok(to_vtt(transcript)),
        ExportFormat::Txt => Ok(to_txt(transcript)),
        ExportFormat::Json => serde_json::to_string_pretty(transcript),
    }
}

fn to_txt(transcript: &Transcript) -> String {
    let mut out = String::new();
    for segment in &transcript.segments {
        let text = segment.text.trim();
        if !text.is_empty() {
            out.push_str(text);
            out.push('\n');
        }
    }
    out
}

fn to_srt(transcript: &Transcript) -> String {
    let mut out = String::new();
    for (idx, segment) in transcript.segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            idx + 1,
            srt_timestamp(segment.start),
            srt_timestamp(segment.end),
            speaker_prefixed(segment.speaker.as_deref(), segment.text.trim()),
        ));
    }
    out
}

fn to_vtt(transcript: &Transcript) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for segment in &transcript.segments {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            vtt_timestamp(segment.start),
            vtt_timestamp(segment.end),
            speaker_prefixed(segment.speaker.as_deref(), segment.text.trim()),
        ));
    }
    out
}

fn speaker_prefixed(speaker: Option<&str>, text: &str) -> String {
    match speaker {
        Some(speaker) => format!("[{}] {}", speaker, text),
        None => text.to_string(),
    }
}

fn split_timestamp(seconds: f64) -> (u64, u64, u64, u64) {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    (
        total_ms / 3_600_000,
        (total_ms / 60_000) % 60,
        (total_ms / 1000) % 60,
        total_ms % 1000,
    )
}

fn srt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn vtt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}
