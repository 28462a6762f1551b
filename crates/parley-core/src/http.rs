use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::audio;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{HistoryEntry, RawReply};

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
    history: &'a [HistoryEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Body of `GET /api/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthReport {
    pub status: String,
    pub modules_initialized: bool,
}

/// Request/response client for the non-streaming endpoints
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> ChatResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/text`: the whole reply in one response
    pub async fn send_text(
        &self,
        text: &str,
        history: &[HistoryEntry],
        session_id: Option<&str>,
    ) -> ChatResult<RawReply> {
        let url = format!("{}/api/text", self.base_url);

        let request = TextRequest {
            text,
            history,
            session_id,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        read_reply(response).await
    }

    /// `POST /api/speech`: upload a recording, get the transcription and reply
    pub async fn send_speech(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        history: &[HistoryEntry],
    ) -> ChatResult<RawReply> {
        let url = format!("{}/api/speech", self.base_url);

        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("audio", part)
            .text("history", serde_json::to_string(history)?);

        let response = self.client.post(&url).multipart(form).send().await?;
        read_reply(response).await
    }

    pub async fn health(&self) -> ChatResult<HealthReport> {
        let url = format!("{}/api/health", self.base_url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "health check failed with status: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Download the clip behind `audio_url` into `dir`
    pub async fn fetch_audio(&self, audio_url: &str, dir: &Path) -> ChatResult<PathBuf> {
        let url = audio::resolve_audio_url(&self.base_url, audio_url)?;
        let file_name = audio::clip_file_name(&url);

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "audio unavailable ({})",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "audio clip cached");
        Ok(path)
    }
}

// Error statuses still carry a JSON body with an `error` field
async fn read_reply(response: Response) -> ChatResult<RawReply> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<RawReply>(&body)
        .ok()
        .and_then(|reply| reply.error)
        .unwrap_or_else(|| format!("request failed with status: {}", status));
    Err(ChatError::Upstream(message))
}
