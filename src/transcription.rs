//! Voice-note transcription.
//!
//! Audio messages are turned into text before aggregation so the agent only
//! ever sees text turns. Bytes are shipped to a hosted Whisper-compatible
//! API; any failure degrades to a placeholder instead of dropping the turn.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::TranscriptionConfig;

/// Stored in place of a voice note when transcription is off or fails.
pub const AUDIO_PLACEHOLDER: &str = "[audio message]";

pub struct TranscriptionService {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl TranscriptionService {
    /// Build from config. Returns `None` when disabled or no API key is set;
    /// callers then store [`AUDIO_PLACEHOLDER`] for voice notes.
    pub fn new(config: &TranscriptionConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.api_key.is_empty() {
            warn!("transcription enabled but no API key configured; voice notes become placeholders");
            return None;
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Some(TranscriptionService {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    /// Transcribe raw audio bytes via the hosted Whisper API.
    pub async fn transcribe(&self, data: Vec<u8>, mime_type: &str) -> Result<String> {
        // Strip codec parameters ("audio/ogg; codecs=opus") before mapping.
        let bare_mime = mime_type.split(';').next().unwrap_or(mime_type).trim();
        let file_name = format!("voice.{}", extension_for(bare_mime));
        debug!(
            "transcribing voice note: {} ({}, {} bytes)",
            file_name,
            bare_mime,
            data.len()
        );

        let file_part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str(bare_mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "json")
            .text("temperature", "0");

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .context("whisper API request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("whisper API returned {}: {}", status, body);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("failed to parse whisper API response")?;
        let text = body["text"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            bail!("whisper API returned an empty transcription");
        }
        Ok(text)
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "webm",
        "audio/flac" => "flac",
        "audio/amr" => "amr",
        _ => "ogg",
    }
}
