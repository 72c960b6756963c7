//! Spoken announcements via a VOICEVOX-compatible engine, cached on disk.
//!
//! Pipeline (on cache miss):
//! 1. POST /audio_query with the raw text → query object with a kana reading
//! 2. Patch the "震度N" fragment of the kana so the accent splits correctly
//! 3. POST /accent_phrases with the patched kana → accent phrases
//! 4. POST /synthesis with the query, new phrases, faster rate, louder volume → WAV
//!
//! Files are named by the SHA-256 of the text and never invalidated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::VoiceConfig;
use crate::scale::Scale;

const SPEED_SCALE: f64 = 1.4;
const VOLUME_SCALE: f64 = 2.0;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Synthesis unavailable ({stage}): {reason}")]
    SynthesisUnavailable { stage: &'static str, reason: String },

    #[error("Failed to write voice cache {}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl VoiceError {
    fn unavailable(stage: &'static str, reason: impl ToString) -> Self {
        Self::SynthesisUnavailable {
            stage,
            reason: reason.to_string(),
        }
    }
}

pub fn quake_observation_text(area: &str, scale: Scale) -> String {
    format!("{area}で、震度{}の地震が発生しました", scale.spoken_form())
}

pub fn warning_text(area: &str, scale: Scale) -> String {
    format!("震度{}、{area}", scale.spoken_form())
}

pub fn warning_followup_text(scale: Scale) -> String {
    format!("震度{}", scale.spoken_form())
}

/// Turns announcement text into a playable audio file.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// `scale` selects the pronunciation patch applied to the reading.
    async fn synthesize(&self, text: &str, scale: Scale) -> Result<PathBuf, VoiceError>;

    async fn quake_observation_voice(&self, area: &str, scale: Scale) -> Result<PathBuf, VoiceError> {
        self.synthesize(&quake_observation_text(area, scale), scale).await
    }

    async fn warning_voice(&self, area: &str, scale: Scale) -> Result<PathBuf, VoiceError> {
        self.synthesize(&warning_text(area, scale), scale).await
    }

    async fn warning_followup_voice(&self, scale: Scale) -> Result<PathBuf, VoiceError> {
        self.synthesize(&warning_followup_text(scale), scale).await
    }
}

pub struct VoicevoxSynthesizer {
    client: Client,
    engine_url: String,
    speaker: String,
    cache_dir: PathBuf,
}

impl VoicevoxSynthesizer {
    pub fn new(config: &VoiceConfig) -> Result<Self, VoiceError> {
        let mut builder = Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(VoiceError::Client)?;

        Ok(Self {
            client,
            engine_url: config.engine_url.trim_end_matches('/').to_string(),
            speaker: config.speaker.to_string(),
            cache_dir: config.cache_dir.clone(),
        })
    }

    pub fn cache_path(&self, text: &str) -> PathBuf {
        let hash = Sha256::digest(text.as_bytes());
        self.cache_dir.join(format!("{hash:x}.wav"))
    }

    async fn post(
        &self,
        stage: &'static str,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response, VoiceError> {
        let url = format!("{}/{stage}", self.engine_url);
        let mut request = self.client.post(&url).query(params);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| VoiceError::unavailable(stage, e))?;
        if !resp.status().is_success() {
            return Err(VoiceError::unavailable(stage, format!("status {}", resp.status())));
        }
        Ok(resp)
    }

    async fn post_json(
        &self,
        stage: &'static str,
        params: &[(&str, &str)],
    ) -> Result<Value, VoiceError> {
        self.post(stage, params, None)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| VoiceError::unavailable(stage, e))
    }

    async fn render(&self, text: &str, scale: Scale) -> Result<Vec<u8>, VoiceError> {
        let speaker = self.speaker.as_str();

        let mut query = self
            .post_json("audio_query", &[("speaker", speaker), ("text", text)])
            .await?;
        let kana = query["kana"]
            .as_str()
            .ok_or_else(|| VoiceError::unavailable("audio_query", "response has no kana"))?;

        let (from, to) = scale.phonetic_pair();
        let kana = kana.replacen(from, to, 1);
        debug!("Patched kana: {kana}");

        let phrases = self
            .post_json(
                "accent_phrases",
                &[("speaker", speaker), ("is_kana", "true"), ("text", &kana)],
            )
            .await?;

        let Some(fields) = query.as_object_mut() else {
            return Err(VoiceError::unavailable("audio_query", "response is not an object"));
        };
        fields.insert("accent_phrases".into(), phrases);
        fields.insert("speedScale".into(), json!(SPEED_SCALE));
        fields.insert("volumeScale".into(), json!(VOLUME_SCALE));

        let audio = self
            .post("synthesis", &[("speaker", speaker)], Some(&query))
            .await?
            .bytes()
            .await
            .map_err(|e| VoiceError::unavailable("synthesis", e))?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for VoicevoxSynthesizer {
    async fn synthesize(&self, text: &str, scale: Scale) -> Result<PathBuf, VoiceError> {
        let path = self.cache_path(text);
        if is_cached(&path).await {
            debug!("Voice cache hit: {}", path.display());
            return Ok(path);
        }

        let t_start = Instant::now();
        let audio = self.render(text, scale).await?;

        write_cache(&path, &audio)
            .await
            .map_err(|source| VoiceError::Cache {
                path: path.clone(),
                source,
            })?;

        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        info!("Synthesized \"{text}\" → {} ({latency_ms:.0}ms)", path.display());
        Ok(path)
    }
}

async fn is_cached(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Write into a temp file next to `path` and rename it into place, so a
/// cache entry is either complete or absent.
async fn write_cache(path: &Path, audio: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("wav.{}.{seq}.tmp", std::process::id()));
    if let Err(e) = tokio::fs::write(&tmp, audio).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    #[derive(Clone, Default)]
    struct FakeEngine {
        calls: Arc<Mutex<Vec<&'static str>>>,
        accent_params: Arc<Mutex<Option<HashMap<String, String>>>>,
        synthesis_body: Arc<Mutex<Option<Value>>>,
        fail_synthesis: bool,
    }

    async fn audio_query(
        State(engine): State<FakeEngine>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        engine.calls.lock().unwrap().push("audio_query");
        assert_eq!(params["speaker"], "1");
        Json(json!({
            "kana": "イシカワケンデ、シンドゴジャ'クノ/ジシンガ",
            "accent_phrases": [],
            "speedScale": 1.0,
            "volumeScale": 1.0,
            "outputSamplingRate": 24000
        }))
    }

    async fn accent_phrases(
        State(engine): State<FakeEngine>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        engine.calls.lock().unwrap().push("accent_phrases");
        *engine.accent_params.lock().unwrap() = Some(params);
        Json(json!([{ "moras": [], "accent": 1 }]))
    }

    async fn synthesis(
        State(engine): State<FakeEngine>,
        Json(body): Json<Value>,
    ) -> Result<Vec<u8>, StatusCode> {
        engine.calls.lock().unwrap().push("synthesis");
        *engine.synthesis_body.lock().unwrap() = Some(body);
        if engine.fail_synthesis {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Ok(b"RIFF-fake-wav".to_vec())
    }

    async fn spawn_engine(engine: FakeEngine) -> String {
        let app = Router::new()
            .route("/audio_query", post(audio_query))
            .route("/accent_phrases", post(accent_phrases))
            .route("/synthesis", post(synthesis))
            .with_state(engine);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn cache_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("eqmon-voice-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn synthesizer(engine_url: String, cache_dir: &Path) -> VoicevoxSynthesizer {
        VoicevoxSynthesizer::new(&VoiceConfig {
            engine_url,
            speaker: 1,
            cache_dir: cache_dir.to_path_buf(),
            request_timeout_secs: None,
        })
        .unwrap()
    }

    #[test]
    fn test_templates() {
        assert_eq!(
            quake_observation_text("石川県", Scale::FiveLower),
            "石川県で、震度5弱の地震が発生しました"
        );
        assert_eq!(warning_text("能登", Scale::SixUpper), "震度6強、能登");
        assert_eq!(warning_followup_text(Scale::Four), "震度4");
    }

    #[test]
    fn test_cache_path_is_deterministic() {
        let synth = synthesizer("http://127.0.0.1:1".into(), Path::new("/tmp"));
        let a = synth.cache_path("震度4");
        assert_eq!(a, synth.cache_path("震度4"));
        assert_ne!(a, synth.cache_path("震度5弱"));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".wav".len());
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let engine = FakeEngine::default();
        let url = spawn_engine(engine.clone()).await;
        let dir = cache_dir("cache");
        let synth = synthesizer(url, &dir);

        let first = synth
            .quake_observation_voice("石川県", Scale::FiveLower)
            .await
            .unwrap();
        let second = synth
            .quake_observation_voice("石川県", Scale::FiveLower)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["audio_query", "accent_phrases", "synthesis"]
        );
        assert_eq!(std::fs::read(&first).unwrap(), b"RIFF-fake-wav");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_cache_dir_is_created() {
        let engine = FakeEngine::default();
        let url = spawn_engine(engine.clone()).await;
        let root = cache_dir("nested");
        let nested = root.join("missing").join("voices");
        let synth = synthesizer(url, &nested);

        let path = synth.warning_followup_voice(Scale::Four).await.unwrap();
        assert_eq!(path.parent(), Some(nested.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF-fake-wav");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_cache_write_leaves_no_temp_files() {
        let dir = cache_dir("atomic");
        let path = dir.join("entry.wav");

        write_cache(&path, b"first").await.unwrap();
        write_cache(&path, b"second").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["entry.wav".to_string()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_cache_write_leaves_no_entry() {
        let dir = cache_dir("blocked");
        // A directory squatting on the final name makes the rename fail
        let path = dir.join("entry.wav");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        assert!(write_cache(&path, b"audio").await.is_err());
        assert!(path.is_dir());
        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["entry.wav".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_kana_patch_and_merged_query() {
        let engine = FakeEngine::default();
        let url = spawn_engine(engine.clone()).await;
        let dir = cache_dir("kana");
        let synth = synthesizer(url, &dir);

        synth
            .quake_observation_voice("石川県", Scale::FiveLower)
            .await
            .unwrap();

        let params = engine.accent_params.lock().unwrap().clone().unwrap();
        assert_eq!(params["is_kana"], "true");
        assert_eq!(params["text"], "イシカワケンデ、シ'ンド/ゴ'/ジャ'クノ/ジシンガ");

        let body = engine.synthesis_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["speedScale"], json!(1.4));
        assert_eq!(body["volumeScale"], json!(2.0));
        assert_eq!(body["accent_phrases"], json!([{ "moras": [], "accent": 1 }]));
        assert_eq!(body["outputSamplingRate"], json!(24000));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_synthesis_caches_nothing() {
        let engine = FakeEngine {
            fail_synthesis: true,
            ..FakeEngine::default()
        };
        let url = spawn_engine(engine).await;
        let dir = cache_dir("fail");
        let synth = synthesizer(url, &dir);

        let err = synth.warning_followup_voice(Scale::Four).await.unwrap_err();
        assert!(matches!(
            err,
            VoiceError::SynthesisUnavailable { stage: "synthesis", .. }
        ));
        assert!(!synth.cache_path("震度4").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unreachable_engine() {
        let dir = cache_dir("unreachable");
        let synth = synthesizer("http://127.0.0.1:1".into(), &dir);

        let err = synth.warning_voice("能登", Scale::Seven).await.unwrap_err();
        assert!(matches!(
            err,
            VoiceError::SynthesisUnavailable { stage: "audio_query", .. }
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
