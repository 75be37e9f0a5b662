use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::USER_AGENT;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use storify_contracts::events::{EventPayload, EventWriter};
use storify_contracts::models::ModelSelector;
use storify_contracts::session::{
    write_summary, AudioArtifact, Role, SessionManifest, SessionState, SessionSummary, Transcript,
};
use tempfile::NamedTempFile;

pub const DEFAULT_STORY_MODEL: &str = "gemini-1.5-flash";

const JPEG_QUALITY: u8 = 90;
const TWEAK_PREFIX: &str = "Tweak the previous story as follows: ";
const TTS_MAX_CHUNK_CHARS: usize = 100;
const TTS_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    fn text(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Generate,
    Tweak,
}

impl PromptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptMode::Generate => "generate",
            PromptMode::Tweak => "tweak",
        }
    }
}

/// Ordered message list for one model request.
///
/// Pure with respect to session state: the transcript is passed in as prior
/// history and replayed verbatim, oldest first, with the new user message
/// always last.
///
/// - generate mode: `[system]` ++ replay ++ one user message carrying the
///   guideline text and the image as two parts
/// - tweak mode: replay ++ one user message wrapping the revision text; no
///   system instruction and no image are re-sent
pub fn build_messages(
    system_instruction: &str,
    image: Option<&ImagePayload>,
    user_input: &str,
    history: &Transcript,
    mode: PromptMode,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if mode == PromptMode::Generate {
        messages.push(ChatMessage::text(MessageKind::System, system_instruction));
    }

    for turn in history.turns() {
        let kind = match turn.role {
            Role::User => MessageKind::User,
            Role::Assistant => MessageKind::Assistant,
        };
        messages.push(ChatMessage::text(kind, turn.text.as_str()));
    }

    match mode {
        PromptMode::Tweak => {
            messages.push(ChatMessage::text(
                MessageKind::User,
                format!("{TWEAK_PREFIX}{user_input}"),
            ));
        }
        PromptMode::Generate => {
            let mut parts = vec![MessagePart::Text(user_input.to_string())];
            if let Some(image) = image {
                parts.push(MessagePart::InlineImage {
                    mime_type: image.mime_type.to_string(),
                    data: image.data.clone(),
                });
            }
            messages.push(ChatMessage {
                kind: MessageKind::User,
                parts,
            });
        }
    }

    messages
}

/// Normalized upload, re-encoded as base64 JPEG. Per-upload and ephemeral:
/// recomputed on every attach, never stored in the transcript, never logged
/// raw.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub mime_type: &'static str,
    pub data: String,
    pub width: u32,
    pub height: u32,
    pub encoded_len: usize,
    pub fingerprint: String,
    pub source: String,
}

impl ImagePayload {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

pub fn prepare_image(bytes: &[u8], source: &str) -> Result<ImagePayload> {
    let decoded = image::load_from_memory(bytes).context("image decode failed")?;
    let (width, height) = decoded.dimensions();

    // Alpha is discarded, not composited against a background; transparent
    // regions keep their underlying color values.
    let flattened = decoded.to_rgb8();

    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
    encoder
        .encode_image(&flattened)
        .context("image jpeg encode failed")?;

    let fingerprint = hex_digest(&encoded);
    let encoded_len = encoded.len();
    Ok(ImagePayload {
        mime_type: "image/jpeg",
        data: BASE64.encode(&encoded),
        width,
        height,
        encoded_len,
        fingerprint,
        source: source.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct StoryRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Finite, non-restartable sequence of narrative fragments.
///
/// Single consumer, one fragment per iteration in arrival order; the
/// concatenation of every fragment equals the blocking narrative for the
/// same request. Cancelling an in-flight generation is not supported: drain
/// the stream to completion or to its first terminal error.
pub struct FragmentStream {
    inner: Box<dyn Iterator<Item = Result<String>> + Send>,
}

impl FragmentStream {
    fn new(inner: Box<dyn Iterator<Item = Result<String>> + Send>) -> Self {
        Self { inner }
    }

    pub fn from_fragments(fragments: Vec<String>) -> Self {
        Self::new(Box::new(fragments.into_iter().map(Ok)))
    }
}

impl Iterator for FragmentStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

pub trait StoryProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &StoryRequest) -> Result<String>;
    fn stream(&self, request: &StoryRequest) -> Result<FragmentStream>;
}

#[derive(Default)]
pub struct StoryProviderRegistry {
    providers: BTreeMap<String, Box<dyn StoryProvider>>,
}

impl StoryProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: StoryProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn StoryProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

const DRYRUN_OPENINGS: &[&str] = &[
    "Once upon a time",
    "Long before the maps were drawn",
    "At the quiet edge of evening",
    "In a place the roads forgot",
];

const DRYRUN_CLOSINGS: &[&str] = &[
    "and the story folded itself into the hush that followed.",
    "and nobody who saw it ever told it the same way twice.",
    "and the last of the light kept the secret.",
    "and that, the picture insists, is exactly how it happened.",
];

pub struct DryrunStoryProvider;

impl DryrunStoryProvider {
    fn narrative(request: &StoryRequest) -> String {
        let guidelines = request
            .messages
            .last()
            .map(ChatMessage::joined_text)
            .unwrap_or_default();
        let digest = Sha256::digest(guidelines.as_bytes());
        let opening = DRYRUN_OPENINGS[digest[0] as usize % DRYRUN_OPENINGS.len()];
        let closing = DRYRUN_CLOSINGS[digest[1] as usize % DRYRUN_CLOSINGS.len()];
        let brief = truncate_text(guidelines.trim(), 120);
        format!(
            "{opening}, the image gave up its story. {brief} From one small detail the telling grew, {closing}"
        )
    }
}

impl StoryProvider for DryrunStoryProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &StoryRequest) -> Result<String> {
        Ok(Self::narrative(request))
    }

    fn stream(&self, request: &StoryRequest) -> Result<FragmentStream> {
        let narrative = Self::narrative(request);
        let fragments = narrative
            .split_inclusive(' ')
            .map(str::to_string)
            .collect::<Vec<String>>();
        Ok(FragmentStream::from_fragments(fragments))
    }
}

pub struct GeminiStoryProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiStoryProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str, streaming: bool) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        if streaming {
            format!("{}/{}:streamGenerateContent?alt=sse", self.api_base, model_path)
        } else {
            format!("{}/{}:generateContent", self.api_base, model_path)
        }
    }

    fn request_payload(messages: &[ChatMessage]) -> Value {
        let mut contents = Vec::new();
        let mut system_instruction: Option<Value> = None;

        for message in messages {
            let parts = message
                .parts
                .iter()
                .map(Self::wire_part)
                .collect::<Vec<Value>>();
            match message.kind {
                MessageKind::System => {
                    system_instruction = Some(json!({ "parts": parts }));
                }
                MessageKind::User => {
                    contents.push(json!({ "role": "user", "parts": parts }));
                }
                MessageKind::Assistant => {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
        }

        let mut payload = Map::new();
        payload.insert("contents".to_string(), Value::Array(contents));
        if let Some(system_instruction) = system_instruction {
            payload.insert("systemInstruction".to_string(), system_instruction);
        }
        Value::Object(payload)
    }

    fn wire_part(part: &MessagePart) -> Value {
        match part {
            MessagePart::Text(text) => json!({ "text": text }),
            MessagePart::InlineImage { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": data,
                }
            }),
        }
    }

    fn post(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<HttpResponse> {
        self.http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(Duration::from_secs(90))
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))
    }

    fn chunk_text(payload: &Value) -> String {
        let mut out = String::new();
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }
        out
    }
}

impl Default for GeminiStoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StoryProvider for GeminiStoryProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, request: &StoryRequest) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model, false);
        let payload = Self::request_payload(&request.messages);
        let response = self.post(&endpoint, &api_key, &payload)?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let narrative = Self::chunk_text(&response_payload);
        if narrative.is_empty() {
            bail!("Gemini returned no narrative text");
        }
        Ok(narrative)
    }

    fn stream(&self, request: &StoryRequest) -> Result<FragmentStream> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model, true);
        let payload = Self::request_payload(&request.messages);
        let response = self.post(&endpoint, &api_key, &payload)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Gemini stream request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }

        Ok(FragmentStream::new(Box::new(SseFragments {
            lines: BufReader::new(response).lines(),
            failed: false,
        })))
    }
}

struct SseFragments {
    lines: Lines<BufReader<HttpResponse>>,
    failed: bool,
}

impl Iterator for SseFragments {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(
                        anyhow::Error::new(err).context("Gemini stream read failed")
                    ));
                }
            };
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let chunk: Value = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(
                        anyhow::Error::new(err).context("Gemini stream chunk decode failed")
                    ));
                }
            };
            let fragment = GeminiStoryProvider::chunk_text(&chunk);
            if fragment.is_empty() {
                continue;
            }
            return Some(Ok(fragment));
        }
    }
}

pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;
    fn synthesize(&self, text: &str, lang: &str, out_path: &Path) -> Result<()>;
}

#[derive(Default)]
pub struct SpeechSynthesizerRegistry {
    synthesizers: BTreeMap<String, Box<dyn SpeechSynthesizer>>,
}

impl SpeechSynthesizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: SpeechSynthesizer + 'static>(&mut self, synthesizer: S) {
        self.synthesizers
            .insert(synthesizer.name().to_string(), Box::new(synthesizer));
    }

    pub fn get(&self, name: &str) -> Option<&dyn SpeechSynthesizer> {
        self.synthesizers
            .get(name)
            .map(|synthesizer| synthesizer.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.synthesizers.keys().cloned().collect()
    }
}

/// Google Translate's TTS endpoint. Text is split into chunks the endpoint
/// accepts, one GET per chunk, and the MP3 bodies are concatenated in order
/// (MPEG frames concatenate cleanly).
pub struct TranslateTtsSynthesizer {
    api_base: String,
    http: HttpClient,
}

impl TranslateTtsSynthesizer {
    pub fn new() -> Self {
        Self {
            api_base: env::var("TRANSLATE_TTS_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://translate.google.com/translate_tts".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for TranslateTtsSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechSynthesizer for TranslateTtsSynthesizer {
    fn name(&self) -> &str {
        "translate"
    }

    fn synthesize(&self, text: &str, lang: &str, out_path: &Path) -> Result<()> {
        let chunks = split_tts_chunks(text, TTS_MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            bail!("nothing to synthesize");
        }

        let total = chunks.len();
        let mut audio: Vec<u8> = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let query: Vec<(&str, String)> = vec![
                ("ie", "UTF-8".to_string()),
                ("client", "tw-ob".to_string()),
                ("tl", lang.to_string()),
                ("q", chunk.clone()),
                ("textlen", chunk.chars().count().to_string()),
                ("idx", idx.to_string()),
                ("total", total.to_string()),
            ];
            let response = self
                .http
                .get(&self.api_base)
                .query(&query)
                .header(USER_AGENT, TTS_USER_AGENT)
                .timeout(Duration::from_secs(30))
                .send()
                .with_context(|| format!("speech synthesis request failed ({})", self.api_base))?;
            let status = response.status();
            if !status.is_success() {
                let code = status.as_u16();
                let body = response.text().unwrap_or_default();
                bail!(
                    "speech synthesis failed ({code}): {}",
                    truncate_text(&body, 256)
                );
            }
            let bytes = response
                .bytes()
                .context("speech synthesis body read failed")?;
            audio.extend_from_slice(&bytes);
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(out_path, audio)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        Ok(())
    }
}

/// Deterministic placeholder audio for tests and offline demos.
pub struct DryrunSynthesizer;

impl SpeechSynthesizer for DryrunSynthesizer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn synthesize(&self, text: &str, lang: &str, out_path: &Path) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(lang.as_bytes());
        let digest = hasher.finalize();

        let mut payload = Vec::with_capacity(3 + digest.len());
        payload.extend_from_slice(b"ID3");
        payload.extend_from_slice(&digest);

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(out_path, payload)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        Ok(())
    }
}

fn split_tts_chunks(text: &str, max_chars: usize) -> Vec<String> {
    fn push_current(current: &mut String, current_chars: &mut usize, out: &mut Vec<String>) {
        if !current.is_empty() {
            out.push(std::mem::take(current));
            *current_chars = 0;
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in text.split_whitespace() {
        let word_chars = word.chars().count();
        if word_chars > max_chars {
            push_current(&mut current, &mut current_chars, &mut chunks);
            // Unbroken run longer than the endpoint accepts; hard split.
            let mut piece = String::new();
            let mut piece_chars = 0usize;
            for ch in word.chars() {
                piece.push(ch);
                piece_chars += 1;
                if piece_chars == max_chars {
                    chunks.push(std::mem::take(&mut piece));
                    piece_chars = 0;
                }
            }
            if !piece.is_empty() {
                chunks.push(piece);
            }
            continue;
        }

        let needed = if current.is_empty() {
            word_chars
        } else {
            word_chars + 1
        };
        if current_chars + needed > max_chars {
            push_current(&mut current, &mut current_chars, &mut chunks);
            current.push_str(word);
            current_chars = word_chars;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_chars += needed;
        }
    }
    push_current(&mut current, &mut current_chars, &mut chunks);
    chunks
}

fn default_story_registry() -> StoryProviderRegistry {
    let mut providers = StoryProviderRegistry::new();
    providers.register(DryrunStoryProvider);
    providers.register(GeminiStoryProvider::new());
    providers
}

fn default_speech_registry() -> SpeechSynthesizerRegistry {
    let mut synthesizers = SpeechSynthesizerRegistry::new();
    synthesizers.register(DryrunSynthesizer);
    synthesizers.register(TranslateTtsSynthesizer::new());
    synthesizers
}

#[derive(Debug, Clone)]
pub struct DownloadBundle {
    pub text_path: PathBuf,
    pub audio_path: PathBuf,
}

fn write_text_artifact(narrative: &str, dest: &Path) -> Result<()> {
    // Scoped temp: written, copied out for the download, then removed.
    let mut temp = NamedTempFile::new().context("text artifact temp create failed")?;
    temp.write_all(narrative.as_bytes())
        .context("text artifact write failed")?;
    temp.flush().context("text artifact flush failed")?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(temp.path(), dest)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(())
}

/// One-shot export of a narrative that is not tied to a live session: text
/// artifact plus freshly synthesized audio, both under `dest_dir`.
pub fn export_narrative(
    narrative: &str,
    voice: &str,
    speech_model: Option<&str>,
    dest_dir: &Path,
) -> Result<DownloadBundle> {
    fs::create_dir_all(dest_dir)?;
    let text_path = dest_dir.join("story.txt");
    write_text_artifact(narrative, &text_path)?;

    let selector = ModelSelector::new(None);
    let selection = selector
        .select(speech_model, "speech")
        .map_err(anyhow::Error::msg)?;
    let synthesizers = default_speech_registry();
    let Some(synthesizer) = synthesizers.get(&selection.model.provider) else {
        bail!(
            "no synthesizer registered for provider '{}'",
            selection.model.provider
        );
    };
    let audio_path = dest_dir.join("story.mp3");
    synthesizer.synthesize(narrative, voice, &audio_path)?;

    Ok(DownloadBundle {
        text_path,
        audio_path,
    })
}

#[derive(Debug, Clone)]
struct PendingStory {
    guidelines: String,
    mode: PromptMode,
    model: String,
    provider: String,
}

/// Session-scoped context object driving one interactive session.
///
/// Owns the transcript, the current image payload, the single-slot audio
/// cache, the session manifest and the event log. All mutation happens on
/// the single interaction thread; there are no ambient globals.
pub struct StorySession {
    session_dir: PathBuf,
    events: EventWriter,
    state: SessionState,
    manifest: SessionManifest,
    selector: ModelSelector,
    story_model: Option<String>,
    speech_model: Option<String>,
    voice: String,
    image: Option<ImagePayload>,
    providers: StoryProviderRegistry,
    synthesizers: SpeechSynthesizerRegistry,
    pending: Option<PendingStory>,
    started_at: String,
    summary_path: PathBuf,
}

impl StorySession {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        story_model: Option<String>,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_label = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_label);
        let manifest_path = session_dir.join("session.json");
        let manifest = if manifest_path.exists() {
            SessionManifest::load(&manifest_path)
        } else {
            SessionManifest::new(&manifest_path)
        };
        let summary_path = session_dir.join("summary.json");
        let started_at = now_utc_iso();

        events.emit(
            "session_started",
            map_object(json!({
                "session_dir": session_dir.to_string_lossy().to_string(),
                "story_model": story_model,
            })),
        )?;

        Ok(Self {
            session_dir,
            events,
            state: SessionState::default(),
            manifest,
            selector: ModelSelector::new(None),
            story_model,
            speech_model: None,
            voice: "en".to_string(),
            image: None,
            providers: default_story_registry(),
            synthesizers: default_speech_registry(),
            pending: None,
            started_at,
            summary_path,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn image(&self) -> Option<&ImagePayload> {
        self.image.as_ref()
    }

    pub fn set_story_model(&mut self, model: Option<String>) {
        self.story_model = model;
    }

    pub fn story_model(&self) -> Option<&str> {
        self.story_model.as_deref()
    }

    pub fn set_speech_model(&mut self, model: Option<String>) {
        self.speech_model = model;
    }

    pub fn set_voice(&mut self, voice: impl Into<String>) {
        self.voice = voice.into();
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    /// Texts of committed stories, oldest first.
    pub fn stories(&self) -> Vec<&str> {
        self.state.transcript().stories()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn attach_image(&mut self, bytes: &[u8], source: &str) -> Result<()> {
        let payload = prepare_image(bytes, source)?;
        self.events.emit(
            "image_attached",
            map_object(json!({
                "source": payload.source,
                "width": payload.width,
                "height": payload.height,
                "encoded_bytes": payload.encoded_len,
                "fingerprint": payload.fingerprint,
            })),
        )?;
        self.image = Some(payload);
        Ok(())
    }

    /// Blocking generation: the user turn is appended first, and the
    /// assistant turn only on success, so a failure leaves the transcript
    /// with the dangling user turn (visible as an absent reply).
    pub fn generate(&mut self, guidelines: &str, mode: PromptMode) -> Result<String> {
        let request = self.begin_turn(guidelines, mode)?;
        let provider_name = self
            .pending
            .as_ref()
            .map(|pending| pending.provider.clone())
            .unwrap_or_default();
        let Some(provider) = self.providers.get(&provider_name) else {
            self.record_generation_failure(&format!(
                "no story provider registered for '{provider_name}'"
            ))?;
            bail!("no story provider registered for '{provider_name}'");
        };
        let result = provider.complete(&request);
        match result {
            Ok(narrative) => {
                self.commit_narrative(&narrative)?;
                Ok(narrative)
            }
            Err(err) => {
                self.record_generation_failure(&error_chain_text(&err, 512))?;
                Err(err)
            }
        }
    }

    /// Incremental generation: appends the user turn and hands the caller
    /// the fragment stream. The caller accumulates fragments, then either
    /// `commit_narrative` or `record_generation_failure` — a partial
    /// fragment sequence is never committed.
    pub fn open_stream(&mut self, guidelines: &str, mode: PromptMode) -> Result<FragmentStream> {
        let request = self.begin_turn(guidelines, mode)?;
        let provider_name = self
            .pending
            .as_ref()
            .map(|pending| pending.provider.clone())
            .unwrap_or_default();
        let Some(provider) = self.providers.get(&provider_name) else {
            self.record_generation_failure(&format!(
                "no story provider registered for '{provider_name}'"
            ))?;
            bail!("no story provider registered for '{provider_name}'");
        };
        let result = provider.stream(&request);
        match result {
            Ok(stream) => Ok(stream),
            Err(err) => {
                self.record_generation_failure(&error_chain_text(&err, 512))?;
                Err(err)
            }
        }
    }

    pub fn commit_narrative(&mut self, narrative: &str) -> Result<usize> {
        let Some(pending) = self.pending.take() else {
            bail!("no story generation in flight");
        };
        self.state.transcript_mut().push_assistant(narrative);
        let record =
            self.manifest
                .add_story(pending.mode.as_str(), &pending.guidelines, narrative);
        self.manifest.save()?;
        let story_index = self.state.transcript().stories().len() - 1;
        self.events.emit(
            "turn_committed",
            map_object(json!({
                "story_id": record.story_id,
                "mode": pending.mode.as_str(),
                "model": pending.model,
                "provider": pending.provider,
                "narrative_chars": narrative.chars().count(),
            })),
        )?;
        Ok(story_index)
    }

    pub fn record_generation_failure(&mut self, message: &str) -> Result<()> {
        let pending = self.pending.take();
        self.events.emit(
            "generation_failed",
            map_object(json!({
                "error": message,
                "mode": pending
                    .as_ref()
                    .map(|entry| entry.mode.as_str())
                    .unwrap_or("unknown"),
                "model": pending
                    .as_ref()
                    .map(|entry| entry.model.as_str())
                    .unwrap_or("unknown"),
            })),
        )?;
        Ok(())
    }

    fn begin_turn(&mut self, guidelines: &str, mode: PromptMode) -> Result<StoryRequest> {
        if self.pending.is_some() {
            bail!("a story generation is already in flight");
        }
        if mode == PromptMode::Generate && self.image.is_none() {
            bail!("no image attached; attach one before generating");
        }

        let selection = self
            .selector
            .select(self.story_model.as_deref(), "story")
            .map_err(anyhow::Error::msg)?;

        let image = match mode {
            PromptMode::Generate => self.image.as_ref(),
            PromptMode::Tweak => None,
        };
        let messages = build_messages(
            self.state.system_instruction(),
            image,
            guidelines,
            self.state.transcript(),
            mode,
        );
        self.state.transcript_mut().push_user(guidelines);

        self.events.emit(
            "story_requested",
            map_object(json!({
                "mode": mode.as_str(),
                "model": selection.model.name,
                "provider": selection.model.provider,
                "fallback_reason": selection.fallback_reason,
                "replayed_turns": self.state.transcript().len() - 1,
                "messages": messages.len(),
            })),
        )?;

        self.pending = Some(PendingStory {
            guidelines: guidelines.to_string(),
            mode,
            model: selection.model.name.clone(),
            provider: selection.model.provider.clone(),
        });

        Ok(StoryRequest {
            model: selection.model.name,
            messages,
        })
    }

    /// Prepares both downloadable artifacts for the chosen story.
    ///
    /// The text artifact goes through a scoped temp file and lands as
    /// `story.txt`. The audio artifact is the session's single-slot cache:
    /// synthesized on the first request, reused afterwards, and copied out
    /// as `story.mp3` without evicting the cached file. A synthesis failure
    /// leaves the slot empty so a later attempt retries.
    pub fn prepare_download(&mut self, story_index: usize, dest_dir: &Path) -> Result<DownloadBundle> {
        let narrative = {
            let stories = self.state.transcript().stories();
            let Some(text) = stories.get(story_index) else {
                bail!(
                    "no story at index {} (have {})",
                    story_index + 1,
                    stories.len()
                );
            };
            text.to_string()
        };

        self.events.emit(
            "export_started",
            map_object(json!({
                "story": story_index + 1,
                "dest_dir": dest_dir.to_string_lossy().to_string(),
            })),
        )?;

        fs::create_dir_all(dest_dir)?;
        let text_path = dest_dir.join("story.txt");
        write_text_artifact(&narrative, &text_path)?;
        self.events.emit(
            "text_artifact_ready",
            map_object(json!({
                "path": text_path.to_string_lossy().to_string(),
                "bytes": narrative.len(),
            })),
        )?;

        let digest = hex_digest(narrative.as_bytes());
        let artifact = match self.state.audio_artifact().cloned() {
            Some(artifact) => {
                self.events.emit(
                    "audio_cache_hit",
                    map_object(json!({
                        "path": artifact.path.to_string_lossy().to_string(),
                        "narrative_digest": artifact.narrative_digest,
                    })),
                )?;
                artifact
            }
            None => {
                let selection = self
                    .selector
                    .select(self.speech_model.as_deref(), "speech")
                    .map_err(anyhow::Error::msg)?;
                let Some(synthesizer) = self.synthesizers.get(&selection.model.provider) else {
                    let message = format!(
                        "no synthesizer registered for provider '{}'",
                        selection.model.provider
                    );
                    self.events.emit(
                        "export_failed",
                        map_object(json!({ "stage": "audio", "error": message })),
                    )?;
                    bail!("{message}");
                };
                let audio_path = self
                    .session_dir
                    .join(format!("story-audio-{}.mp3", &digest[..8]));
                if let Err(err) = synthesizer.synthesize(&narrative, &self.voice, &audio_path) {
                    self.events.emit(
                        "export_failed",
                        map_object(json!({
                            "stage": "audio",
                            "error": error_chain_text(&err, 512),
                        })),
                    )?;
                    return Err(err);
                }
                let artifact = AudioArtifact {
                    path: audio_path,
                    narrative_digest: digest,
                };
                self.state.cache_audio_artifact(artifact.clone());
                self.events.emit(
                    "audio_artifact_ready",
                    map_object(json!({
                        "path": artifact.path.to_string_lossy().to_string(),
                        "narrative_digest": artifact.narrative_digest,
                    })),
                )?;
                artifact
            }
        };

        let audio_dest = dest_dir.join("story.mp3");
        fs::copy(&artifact.path, &audio_dest)
            .with_context(|| format!("failed to write {}", audio_dest.display()))?;

        Ok(DownloadBundle {
            text_path,
            audio_path: audio_dest,
        })
    }

    pub fn finish(&mut self) -> Result<()> {
        let summary = SessionSummary {
            session_id: self.manifest.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_turns: self.state.transcript().len() as u64,
            total_stories: self.state.transcript().stories().len() as u64,
            audio_synthesized: self.state.audio_artifact().is_some(),
        };
        let mut extra = Map::new();
        if let Some(model) = self.story_model.as_deref() {
            extra.insert("story_model".to_string(), Value::String(model.to_string()));
        }
        write_summary(&self.summary_path, &summary, Some(&extra))?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "total_turns": summary.total_turns,
                "total_stories": summary.total_stories,
                "audio_synthesized": summary.audio_synthesized,
            })),
        )?;
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use serde_json::{json, Value};
    use storify_contracts::session::{Role, Transcript, DEFAULT_SYSTEM_INSTRUCTION};

    use super::{
        build_messages, export_narrative, prepare_image, split_tts_chunks, ChatMessage,
        DryrunStoryProvider, DryrunSynthesizer, FragmentStream, GeminiStoryProvider, ImagePayload,
        MessageKind, MessagePart, PromptMode, SpeechSynthesizer, StoryProvider, StoryRequest,
        StorySession,
    };

    fn sample_image() -> ImagePayload {
        ImagePayload {
            mime_type: "image/jpeg",
            data: BASE64.encode(b"jpeg-bytes"),
            width: 2,
            height: 2,
            encoded_len: 10,
            fingerprint: "abc123".to_string(),
            source: "test.png".to_string(),
        }
    }

    fn sample_history() -> Transcript {
        let mut history = Transcript::new();
        history.push_user("a dragon story");
        history.push_assistant("Once upon a time...");
        history
    }

    fn png_bytes(with_alpha: bool) -> Vec<u8> {
        let mut img = RgbaImage::new(4, 4);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let alpha = if with_alpha && x % 2 == 0 { 128 } else { 255 };
            *pixel = Rgba([x as u8 * 40, y as u8 * 40, 90, alpha]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn event_types(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    fn dryrun_session(dir: &Path) -> anyhow::Result<StorySession> {
        let mut session = StorySession::new(
            dir,
            dir.join("events.jsonl"),
            Some("dryrun-story-1".to_string()),
        )?;
        session.set_speech_model(Some("dryrun-voice-1".to_string()));
        Ok(session)
    }

    struct FailingProvider;

    impl StoryProvider for FailingProvider {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn complete(&self, _request: &StoryRequest) -> anyhow::Result<String> {
            anyhow::bail!("model request timed out")
        }

        fn stream(&self, _request: &StoryRequest) -> anyhow::Result<FragmentStream> {
            anyhow::bail!("model request timed out")
        }
    }

    struct FailingSynthesizer;

    impl SpeechSynthesizer for FailingSynthesizer {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn synthesize(&self, _text: &str, _lang: &str, _out_path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("synthesis backend unavailable")
        }
    }

    #[test]
    fn build_generate_has_system_replay_and_image() {
        let history = sample_history();
        let image = sample_image();
        let messages = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            Some(&image),
            "make it about the sea",
            &history,
            PromptMode::Generate,
        );

        assert_eq!(messages.len(), history.len() + 2);
        assert_eq!(messages[0].kind, MessageKind::System);
        assert_eq!(messages[0].joined_text(), DEFAULT_SYSTEM_INSTRUCTION);
        assert_eq!(messages[1].kind, MessageKind::User);
        assert_eq!(messages[1].joined_text(), "a dragon story");
        assert_eq!(messages[2].kind, MessageKind::Assistant);
        assert_eq!(messages[2].joined_text(), "Once upon a time...");

        let last = messages.last().unwrap();
        assert_eq!(last.kind, MessageKind::User);
        assert_eq!(last.parts.len(), 2);
        assert_eq!(last.joined_text(), "make it about the sea");
        assert!(matches!(
            &last.parts[1],
            MessagePart::InlineImage { mime_type, .. } if mime_type == "image/jpeg"
        ));
    }

    #[test]
    fn build_tweak_replays_history_and_wraps_input() {
        let history = sample_history();
        let messages = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            None,
            "give the dragon a name",
            &history,
            PromptMode::Tweak,
        );

        assert_eq!(messages.len(), history.len() + 1);
        assert!(messages
            .iter()
            .all(|message| message.kind != MessageKind::System));
        let last = messages.last().unwrap();
        assert_eq!(last.parts.len(), 1);
        assert_eq!(
            last.joined_text(),
            "Tweak the previous story as follows: give the dragon a name"
        );
    }

    #[test]
    fn build_with_empty_history_still_appends_new_message() {
        let history = Transcript::new();
        let image = sample_image();
        let generate = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            Some(&image),
            "a dragon story",
            &history,
            PromptMode::Generate,
        );
        assert_eq!(generate.len(), 2);
        assert_eq!(generate[0].kind, MessageKind::System);
        assert_eq!(generate[1].kind, MessageKind::User);

        let tweak = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            None,
            "shorter",
            &history,
            PromptMode::Tweak,
        );
        assert_eq!(tweak.len(), 1);
    }

    #[test]
    fn build_replay_preserves_chronological_order() {
        let mut history = Transcript::new();
        for index in 0..4 {
            history.push_user(format!("ask-{index}"));
            history.push_assistant(format!("reply-{index}"));
        }
        let messages = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            None,
            "next",
            &history,
            PromptMode::Tweak,
        );
        let replayed: Vec<String> = messages[..messages.len() - 1]
            .iter()
            .map(ChatMessage::joined_text)
            .collect();
        let expected: Vec<String> = history
            .turns()
            .iter()
            .map(|turn| turn.text.clone())
            .collect();
        assert_eq!(replayed, expected);
    }

    #[test]
    fn prepare_image_flattens_alpha_and_reencodes_jpeg() -> anyhow::Result<()> {
        let payload = prepare_image(&png_bytes(true), "upload.png")?;
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!((payload.width, payload.height), (4, 4));
        assert!(payload.data_uri().starts_with("data:image/jpeg;base64,"));

        let jpeg = BASE64.decode(payload.data.as_bytes())?;
        let reloaded = image::load_from_memory(&jpeg)?;
        assert!(!reloaded.color().has_alpha());
        Ok(())
    }

    #[test]
    fn prepare_image_rejects_garbage() {
        assert!(prepare_image(b"not an image", "junk.bin").is_err());
    }

    #[test]
    fn dryrun_stream_concatenates_to_blocking_narrative() -> anyhow::Result<()> {
        let request = StoryRequest {
            model: "dryrun-story-1".to_string(),
            messages: vec![ChatMessage::text(MessageKind::User, "a dragon story")],
        };
        let provider = DryrunStoryProvider;
        let blocking = provider.complete(&request)?;
        let streamed = provider
            .stream(&request)?
            .collect::<anyhow::Result<Vec<String>>>()?
            .concat();
        assert_eq!(streamed, blocking);
        assert!(!blocking.is_empty());
        Ok(())
    }

    #[test]
    fn gemini_payload_maps_roles_and_parts() {
        let image = sample_image();
        let history = sample_history();
        let messages = build_messages(
            DEFAULT_SYSTEM_INSTRUCTION,
            Some(&image),
            "make it about the sea",
            &history,
            PromptMode::Generate,
        );
        let payload = GeminiStoryProvider::request_payload(&messages);

        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!(DEFAULT_SYSTEM_INSTRUCTION)
        );
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert_eq!(contents[2]["role"], json!("user"));
        assert_eq!(
            contents[2]["parts"][1]["inlineData"]["mimeType"],
            json!("image/jpeg")
        );
    }

    #[test]
    fn gemini_chunk_text_concatenates_candidate_parts() {
        let chunk = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": "Once upon " }, { "text": "a time" }]
                }
            }]
        });
        assert_eq!(GeminiStoryProvider::chunk_text(&chunk), "Once upon a time");
        assert_eq!(GeminiStoryProvider::chunk_text(&json!({})), "");
    }

    #[test]
    fn session_generate_commits_user_and_assistant_turns() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;

        let narrative = session.generate("A dragon story", PromptMode::Generate)?;
        assert!(!narrative.is_empty());

        let turns = session.state().transcript().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "A dragon story");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].text, narrative);

        let types = event_types(&temp.path().join("events.jsonl"));
        assert!(types.contains(&"image_attached".to_string()));
        assert!(types.contains(&"story_requested".to_string()));
        assert!(types.contains(&"turn_committed".to_string()));
        Ok(())
    }

    #[test]
    fn session_generate_requires_an_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;

        let err = session
            .generate("A dragon story", PromptMode::Generate)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("no image attached"));
        assert!(session.state().transcript().is_empty());
        Ok(())
    }

    #[test]
    fn failed_generation_leaves_dangling_user_turn() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;
        session.providers.register(FailingProvider);

        assert!(session.generate("A dragon story", PromptMode::Generate).is_err());

        let transcript = session.state().transcript();
        assert_eq!(transcript.len(), 1);
        assert!(transcript.awaiting_reply());

        let types = event_types(&temp.path().join("events.jsonl"));
        assert!(types.contains(&"generation_failed".to_string()));
        assert!(!types.contains(&"turn_committed".to_string()));

        // The user may resubmit after the failure.
        session.providers.register(DryrunStoryProvider);
        session.generate("A dragon story", PromptMode::Generate)?;
        assert_eq!(session.state().transcript().len(), 3);
        Ok(())
    }

    #[test]
    fn streamed_generation_flow_matches_blocking() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;

        let stream = session.open_stream("A dragon story", PromptMode::Generate)?;
        let narrative = stream.collect::<anyhow::Result<Vec<String>>>()?.concat();
        let story_index = session.commit_narrative(&narrative)?;
        assert_eq!(story_index, 0);

        let other = tempfile::tempdir()?;
        let mut blocking_session = dryrun_session(other.path())?;
        blocking_session.attach_image(&png_bytes(false), "test.png")?;
        let blocking = blocking_session.generate("A dragon story", PromptMode::Generate)?;

        assert_eq!(narrative, blocking);
        Ok(())
    }

    #[test]
    fn only_one_generation_may_be_in_flight() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;

        let _stream = session.open_stream("A dragon story", PromptMode::Generate)?;
        let err = session
            .open_stream("another", PromptMode::Generate)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("already in flight"));
        Ok(())
    }

    #[test]
    fn tweak_mode_sends_no_image_and_no_system_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;
        session.generate("A dragon story", PromptMode::Generate)?;

        // Tweak succeeds without consulting the attached image.
        session.generate("give the dragon a name", PromptMode::Tweak)?;
        let turns = session.state().transcript().turns();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].text, "give the dragon a name");
        assert_eq!(session.stories().len(), 2);
        Ok(())
    }

    #[test]
    fn prepare_download_roundtrips_text_and_caches_audio() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;
        let narrative = session.generate("A dragon story", PromptMode::Generate)?;

        let dest = temp.path().join("downloads");
        let first = session.prepare_download(0, &dest)?;
        assert_eq!(std::fs::read(&first.text_path)?, narrative.as_bytes());
        assert_eq!(first.text_path.file_name().unwrap(), "story.txt");
        assert_eq!(first.audio_path.file_name().unwrap(), "story.mp3");
        assert!(std::fs::read(&first.audio_path)?.starts_with(b"ID3"));

        let second = session.prepare_download(0, &dest)?;
        assert_eq!(first.audio_path, second.audio_path);

        let types = event_types(&temp.path().join("events.jsonl"));
        let synthesized = types
            .iter()
            .filter(|value| *value == "audio_artifact_ready")
            .count();
        let cache_hits = types
            .iter()
            .filter(|value| *value == "audio_cache_hit")
            .count();
        assert_eq!(synthesized, 1);
        assert_eq!(cache_hits, 1);
        Ok(())
    }

    #[test]
    fn failed_synthesis_leaves_audio_slot_empty_for_retry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;
        session.generate("A dragon story", PromptMode::Generate)?;
        session.synthesizers.register(FailingSynthesizer);

        let dest = temp.path().join("downloads");
        assert!(session.prepare_download(0, &dest).is_err());
        assert!(session.state().audio_artifact().is_none());

        session.synthesizers.register(DryrunSynthesizer);
        let bundle = session.prepare_download(0, &dest)?;
        assert!(bundle.audio_path.exists());
        assert!(session.state().audio_artifact().is_some());

        let types = event_types(&temp.path().join("events.jsonl"));
        assert!(types.contains(&"export_failed".to_string()));
        assert!(types.contains(&"audio_artifact_ready".to_string()));
        Ok(())
    }

    #[test]
    fn prepare_download_rejects_out_of_range_story() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        let err = session
            .prepare_download(0, temp.path())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("no story at index 1"));
        Ok(())
    }

    #[test]
    fn finish_writes_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = dryrun_session(temp.path())?;
        session.attach_image(&png_bytes(false), "test.png")?;
        session.generate("A dragon story", PromptMode::Generate)?;
        session.finish()?;

        let raw = std::fs::read_to_string(temp.path().join("summary.json"))?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["total_turns"], json!(2));
        assert_eq!(parsed["total_stories"], json!(1));
        assert_eq!(parsed["audio_synthesized"], json!(false));
        assert_eq!(parsed["story_model"], json!("dryrun-story-1"));
        Ok(())
    }

    #[test]
    fn export_narrative_writes_both_artifacts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dest = temp.path().join("export");
        let bundle = export_narrative(
            "Once upon a time...",
            "en",
            Some("dryrun-voice-1"),
            &dest,
        )?;
        assert_eq!(std::fs::read(&bundle.text_path)?, b"Once upon a time...");
        assert!(bundle.audio_path.exists());
        Ok(())
    }

    #[test]
    fn dryrun_synthesizer_is_deterministic() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = temp.path().join("a.mp3");
        let second = temp.path().join("b.mp3");
        DryrunSynthesizer.synthesize("hello", "en", &first)?;
        DryrunSynthesizer.synthesize("hello", "en", &second)?;
        assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);
        Ok(())
    }

    #[test]
    fn tts_chunks_respect_limit_and_keep_words() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = split_tts_chunks(text, 12);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 12));
        let rejoined = chunks.join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn tts_chunks_hard_split_unbroken_words() {
        let word = "a".repeat(25);
        let chunks = split_tts_chunks(&word, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), word);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
    }

    #[test]
    fn tts_chunks_of_blank_text_are_empty() {
        assert!(split_tts_chunks("   ", 10).is_empty());
    }
}
