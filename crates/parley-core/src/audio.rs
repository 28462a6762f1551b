//! Locating spoken versions of assistant replies.
//!
//! Replies may carry an `audio_url`, usually a server-relative path such as
//! `/static/audio/<id>.mp3`. The server writes the clip as `.wav` under the
//! same stem, so `.mp3` references are rewritten before fetching.

use reqwest::Url;

use crate::error::{ChatError, ChatResult};

/// Rewrite a `.mp3` reference to the `.wav` the server actually serves
pub fn prefer_wav(audio_url: &str) -> String {
    match audio_url.strip_suffix(".mp3") {
        Some(stem) => format!("{}.wav", stem),
        None => audio_url.to_string(),
    }
}

/// Absolute URL for an audio reference. Relative references resolve
/// against the API origin.
pub fn resolve_audio_url(base_url: &str, audio_url: &str) -> ChatResult<Url> {
    let audio_url = prefer_wav(audio_url);
    if let Ok(url) = Url::parse(&audio_url) {
        return Ok(url);
    }
    let base = Url::parse(base_url)
        .map_err(|e| ChatError::Protocol(format!("bad API url {:?}: {}", base_url, e)))?;
    base.join(&audio_url)
        .map_err(|e| ChatError::Protocol(format!("bad audio url {:?}: {}", audio_url, e)))
}

/// File name to cache a clip under
pub fn clip_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "clip.wav".to_string())
}
