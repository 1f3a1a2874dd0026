use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use atelier_contracts::catalog::{substitute_location, StylePreset};
use atelier_contracts::events::EventLog;
use atelier_contracts::history::HistoryStore;
use atelier_contracts::records::{BatchSummary, ImageData, InputItem, NewGeneration, StageResult};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const IMAGE_EDIT_MODEL: &str = "gemini-2.5-flash-image";
const IMAGE_GENERATE_MODEL: &str = "imagen-4.0-generate-001";
const VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";

const DEFAULT_REQUEST_TIMEOUT_S: u64 = 90;
const DEFAULT_TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;
const VIDEO_POLL_INTERVAL_S: u64 = 10;
const VIDEO_POLL_BUDGET_S: u64 = 900;

const DEFAULT_WATERMARK: &str = "ATELIER";
const FAN_OUT_STAGE: &str = "style-fan-out";
const VIDEO_STAGE: &str = "video";

const RATE_LIMIT_MESSAGE: &str =
    "You've likely exceeded the request limit. Please wait a moment before trying again.";
const SERVER_ERROR_MESSAGE: &str = "An unexpected server error occurred. This might be a \
     temporary issue. Please try again in a few moments.";

/// Failure taxonomy for everything the engine does. `Transient` marks
/// failures a caller may retry verbatim; `Validation` marks requests that
/// were never sent anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Generation(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Persistence(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Generation(_) => "generation",
            EngineError::Transient(_) => "transient",
            EngineError::Persistence(_) => "persistence",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// Image edit result: the generated image plus whatever text the model
/// emitted alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub image: ImageData,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    Square,
    Landscape,
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
        }
    }
}

/// The three generation calls every backend must provide. Video generation
/// reports coarse progress through `on_progress` since it can run for
/// minutes.
pub trait GenerationClient: Send + Sync {
    fn edit_image(
        &self,
        prompt: &str,
        inputs: &[ImageData],
        mask: Option<&ImageData>,
    ) -> Result<EditOutcome, EngineError>;

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageData, EngineError>;

    fn generate_video(
        &self,
        prompt: &str,
        image: Option<&ImageData>,
        aspect_ratio: AspectRatio,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Vec<u8>, EngineError>;
}

/// Blocking client for the Gemini generative API.
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
    request_timeout: Duration,
    transport_retries: usize,
    poll_interval: Duration,
    poll_budget: Duration,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            http: HttpClient::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_S),
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            poll_interval: Duration::from_secs(VIDEO_POLL_INTERVAL_S),
            poll_budget: Duration::from_secs(VIDEO_POLL_BUDGET_S),
        }
    }

    pub fn from_env() -> Result<Self, EngineError> {
        let api_key = non_empty_env("ATELIER_API_KEY")
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                EngineError::Validation(
                    "ATELIER_API_KEY, GEMINI_API_KEY, or GOOGLE_API_KEY not set".to_string(),
                )
            })?;
        let mut client = Self::new(api_key);
        if let Some(api_base) = non_empty_env("ATELIER_API_BASE") {
            client.api_base = api_base.trim_end_matches('/').to_string();
        }
        Ok(client)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_budget(mut self, budget: Duration) -> Self {
        self.poll_budget = budget;
        self
    }

    fn post_json(&self, endpoint: &str, payload: &Value) -> Result<Value, EngineError> {
        let mut attempt = 0usize;
        loop {
            let result = self
                .http
                .post(endpoint)
                .query(&[("key", self.api_key.as_str())])
                .timeout(self.request_timeout)
                .json(payload)
                .send();
            match result {
                Ok(response) => return response_json(response),
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if !retryable || attempt >= self.transport_retries {
                        return Err(transport_error(err));
                    }
                    attempt += 1;
                    thread::sleep(Duration::from_secs_f64(RETRY_BACKOFF_S * attempt as f64));
                }
            }
        }
    }

    fn get_json(&self, endpoint: &str) -> Result<Value, EngineError> {
        let response = self
            .http
            .get(endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout)
            .send()
            .map_err(transport_error)?;
        response_json(response)
    }

    fn extract_edit_outcome(response_payload: &Value) -> Result<EditOutcome, EngineError> {
        if let Some(reason) = response_payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            return Err(EngineError::Generation(format!(
                "The request was blocked ({reason}). Adjust the prompt or image and try again."
            )));
        }

        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut image = None;
        let mut texts = Vec::new();
        let mut finish_reason = None;
        let mut blocked_categories = Vec::new();

        for candidate in candidates {
            if finish_reason.is_none() {
                finish_reason = candidate
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            if let Some(ratings) = candidate.get("safetyRatings").and_then(Value::as_array) {
                for rating in ratings {
                    if rating.get("blocked").and_then(Value::as_bool).unwrap_or(false) {
                        if let Some(category) = rating.get("category").and_then(Value::as_str) {
                            blocked_categories.push(category.to_string());
                        }
                    }
                }
            }
            let parts = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        texts.push(text.to_string());
                    }
                }
                if image.is_some() {
                    continue;
                }
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64.decode(data.as_bytes()).map_err(|_| {
                    EngineError::Generation("image payload base64 decode failed".to_string())
                })?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string();
                image = Some(ImageData::new(bytes, mime_type));
            }
        }

        let Some(image) = image else {
            if finish_reason.as_deref() == Some("SAFETY") {
                let detail = if blocked_categories.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", blocked_categories.join(", "))
                };
                return Err(EngineError::Generation(format!(
                    "The request was blocked for safety reasons{detail}. Adjust the prompt \
                     or image and try again."
                )));
            }
            if !texts.is_empty() {
                return Err(EngineError::Generation(format!(
                    "The model did not return an image. {}",
                    texts.join("\n")
                )));
            }
            return Err(EngineError::Generation(
                "The model did not return an image.".to_string(),
            ));
        };

        let text = if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        };
        Ok(EditOutcome { image, text })
    }

    fn download_video(&self, uri: &str) -> Result<Vec<u8>, EngineError> {
        let response = self
            .http
            .get(uri)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            return Err(normalize_api_error(code, &body));
        }
        let bytes = response
            .bytes()
            .map_err(|err| EngineError::Transient(format!("video download failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

impl GenerationClient for GeminiClient {
    fn edit_image(
        &self,
        prompt: &str,
        inputs: &[ImageData],
        mask: Option<&ImageData>,
    ) -> Result<EditOutcome, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        if inputs.is_empty() {
            return Err(EngineError::Validation(
                "image editing requires at least one input image".to_string(),
            ));
        }

        let mut parts: Vec<Value> = inputs.iter().map(inline_image_part).collect();
        let effective_prompt = match mask {
            Some(mask) => {
                parts.push(inline_image_part(mask));
                masked_prompt(prompt)
            }
            None => prompt.to_string(),
        };
        parts.push(json!({ "text": effective_prompt }));

        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
            },
        });
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.api_base, IMAGE_EDIT_MODEL
        );
        let response_payload = self.post_json(&endpoint, &payload)?;
        Self::extract_edit_outcome(&response_payload)
    }

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageData, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }

        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": aspect_ratio.as_str(),
            },
        });
        let endpoint = format!("{}/models/{}:predict", self.api_base, IMAGE_GENERATE_MODEL);
        let response_payload = self.post_json(&endpoint, &payload)?;

        let prediction = response_payload
            .get("predictions")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .cloned()
            .ok_or_else(|| {
                EngineError::Generation("The model did not return an image.".to_string())
            })?;
        let data = prediction
            .get("bytesBase64Encoded")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            return Err(EngineError::Generation(
                "The model did not return an image.".to_string(),
            ));
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .map_err(|_| EngineError::Generation("image payload base64 decode failed".to_string()))?;
        let mime_type = prediction
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        Ok(ImageData::new(bytes, mime_type))
    }

    fn generate_video(
        &self,
        prompt: &str,
        image: Option<&ImageData>,
        aspect_ratio: AspectRatio,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Vec<u8>, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }

        let mut instance = Map::new();
        instance.insert("prompt".to_string(), Value::String(prompt.to_string()));
        if let Some(image) = image {
            instance.insert(
                "image".to_string(),
                json!({
                    "bytesBase64Encoded": image.base64(),
                    "mimeType": image.mime_type,
                }),
            );
        }
        let payload = json!({
            "instances": [Value::Object(instance)],
            "parameters": {
                "numberOfVideos": 1,
                "aspectRatio": aspect_ratio.as_str(),
            },
        });
        let endpoint = format!(
            "{}/models/{}:predictLongRunning",
            self.api_base, VIDEO_MODEL
        );
        let operation = self.post_json(&endpoint, &payload)?;
        let name = operation
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Generation(
                    "video request did not return an operation name".to_string(),
                )
            })?;
        on_progress("Video generation submitted.");

        let started = Instant::now();
        let finished = loop {
            let status = self.get_json(&format!("{}/{}", self.api_base, name))?;
            if status.get("done").and_then(Value::as_bool).unwrap_or(false) {
                break status;
            }
            if started.elapsed() >= self.poll_budget {
                return Err(EngineError::Transient(format!(
                    "video generation did not finish within {}s",
                    self.poll_budget.as_secs()
                )));
            }
            on_progress("Rendering video...");
            thread::sleep(self.poll_interval);
        };

        if let Some(error) = finished.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(EngineError::Generation(format!(
                "Video generation failed: {message}"
            )));
        }
        let uri = find_video_uri(&finished).ok_or_else(|| {
            EngineError::Generation("video response did not include a download link".to_string())
        })?;
        on_progress("Downloading video...");
        self.download_video(&uri)
    }
}

/// Offline client that renders deterministic placeholder artifacts. The
/// output color is derived from the prompt so distinct prompts stay
/// distinguishable.
#[derive(Debug, Default, Clone)]
pub struct DryrunClient;

impl DryrunClient {
    fn solid_image(prompt: &str, width: u32, height: u32) -> Result<ImageData, EngineError> {
        let (r, g, b) = color_from_prompt(prompt);
        let mut canvas = RgbaImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([r, g, b, 255]);
        }
        encode_png(&DynamicImage::ImageRgba8(canvas))
    }
}

impl GenerationClient for DryrunClient {
    fn edit_image(
        &self,
        prompt: &str,
        inputs: &[ImageData],
        _mask: Option<&ImageData>,
    ) -> Result<EditOutcome, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        if inputs.is_empty() {
            return Err(EngineError::Validation(
                "image editing requires at least one input image".to_string(),
            ));
        }
        let (width, height) = image::load_from_memory(&inputs[0].bytes)
            .map(|decoded| (decoded.width(), decoded.height()))
            .unwrap_or((768, 768));
        let image = Self::solid_image(prompt, width, height)?;
        Ok(EditOutcome { image, text: None })
    }

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageData, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        let (width, height) = match aspect_ratio {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Landscape => (1280, 720),
            AspectRatio::Portrait => (720, 1280),
        };
        Self::solid_image(prompt, width, height)
    }

    fn generate_video(
        &self,
        prompt: &str,
        _image: Option<&ImageData>,
        _aspect_ratio: AspectRatio,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Vec<u8>, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        on_progress("Video generation submitted.");
        on_progress("Rendering video...");
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        let digest = hasher.finalize();
        Ok(digest.iter().copied().cycle().take(64).collect())
    }
}

/// One guarded unit of pipeline work: edit the primary image (optionally with
/// a secondary reference and a mask) under a stage id.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage_id: String,
    pub prompt: String,
    pub primary: InputItem,
    pub secondary: Option<ImageData>,
    pub mask: Option<ImageData>,
}

/// One step of an automated chain; the previous step's output becomes the
/// primary input.
#[derive(Debug, Clone)]
pub struct ChainedStage {
    pub stage_id: String,
    pub prompt: String,
    pub secondary: Option<ImageData>,
}

#[derive(Debug)]
pub struct StyleOutcome {
    pub style: String,
    pub result: Result<StageResult, EngineError>,
}

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub image: Option<InputItem>,
    pub aspect_ratio: AspectRatio,
}

/// Outcome of a video run; like [`StageResult`], a failed history write keeps
/// the artifact and surfaces the failure in `save_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutcome {
    pub video: Vec<u8>,
    pub record_id: Option<i64>,
    pub save_error: Option<String>,
    pub source_filename: Option<String>,
}

/// Orchestrates generation stages over one client, one history store, and one
/// event log.
///
/// Stage ids are exclusive: a second request for an id that is still running
/// is rejected up front instead of queued. Generated images are watermarked
/// and persisted before they are returned; a failed history write is reported
/// in the result rather than failing the stage.
pub struct Pipeline {
    client: Box<dyn GenerationClient>,
    history: HistoryStore,
    events: EventLog,
    watermark: Option<String>,
    in_flight: Mutex<HashSet<String>>,
}

struct StageGuard<'a> {
    pipeline: &'a Pipeline,
    stage_id: String,
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.pipeline.in_flight.lock() {
            in_flight.remove(&self.stage_id);
        }
    }
}

impl Pipeline {
    pub fn new(client: Box<dyn GenerationClient>, history: HistoryStore, events: EventLog) -> Self {
        Self {
            client,
            history,
            events,
            watermark: Some(DEFAULT_WATERMARK.to_string()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_watermark(mut self, watermark: Option<String>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Run a single edit stage under its stage id guard.
    pub fn run_stage(&self, request: &StageRequest) -> Result<StageResult, EngineError> {
        let _guard = self.acquire_stage(&request.stage_id)?;
        self.emit(
            "stage_started",
            json!({
                "stage": request.stage_id,
                "prompt": truncate_text(&request.prompt, 160),
                "source": request.primary.display_name,
            }),
        );
        match self.attempt_stage(request) {
            Ok(result) => {
                self.emit(
                    "stage_finished",
                    json!({
                        "stage": request.stage_id,
                        "record_id": result.record_id,
                        "persisted": result.persisted(),
                    }),
                );
                Ok(result)
            }
            Err(err) => {
                self.emit(
                    "stage_failed",
                    json!({
                        "stage": request.stage_id,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Two-step stage: the first prompt produces an intermediate, the second
    /// prompt refines it. The secondary reference is resized to the source
    /// dimensions before step two, and the intermediate is kept on the
    /// history record alongside the final image.
    pub fn run_two_step(
        &self,
        request: &StageRequest,
        step_two_prompt: &str,
    ) -> Result<StageResult, EngineError> {
        let _guard = self.acquire_stage(&request.stage_id)?;
        self.emit(
            "stage_started",
            json!({
                "stage": request.stage_id,
                "prompt": truncate_text(&request.prompt, 160),
                "source": request.primary.display_name,
                "two_step": true,
            }),
        );
        match self.attempt_two_step(request, step_two_prompt) {
            Ok(result) => {
                self.emit(
                    "stage_finished",
                    json!({
                        "stage": request.stage_id,
                        "record_id": result.record_id,
                        "persisted": result.persisted(),
                    }),
                );
                Ok(result)
            }
            Err(err) => {
                self.emit(
                    "stage_failed",
                    json!({
                        "stage": request.stage_id,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Text-to-image stage.
    pub fn run_generate(
        &self,
        stage_id: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<StageResult, EngineError> {
        let _guard = self.acquire_stage(stage_id)?;
        self.emit(
            "stage_started",
            json!({
                "stage": stage_id,
                "prompt": truncate_text(prompt, 160),
            }),
        );
        match self.attempt_generate(prompt, aspect_ratio) {
            Ok(result) => {
                self.emit(
                    "stage_finished",
                    json!({
                        "stage": stage_id,
                        "record_id": result.record_id,
                        "persisted": result.persisted(),
                    }),
                );
                Ok(result)
            }
            Err(err) => {
                self.emit(
                    "stage_failed",
                    json!({
                        "stage": stage_id,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Render the same source through every preset. Presets fail
    /// independently; one bad render never aborts the rest.
    pub fn run_style_fan_out(
        &self,
        primary: &InputItem,
        presets: &[StylePreset],
        location: Option<&str>,
    ) -> Result<Vec<StyleOutcome>, EngineError> {
        if presets.is_empty() {
            return Err(EngineError::Validation(
                "style fan-out requires at least one preset".to_string(),
            ));
        }
        let _guard = self.acquire_stage(FAN_OUT_STAGE)?;
        self.emit(
            "fan_out_started",
            json!({
                "styles": presets.len(),
                "source": primary.display_name,
            }),
        );

        let mut outcomes = Vec::with_capacity(presets.len());
        for preset in presets {
            let prompt = substitute_location(&preset.prompt, location);
            let request = StageRequest {
                stage_id: preset.key.clone(),
                prompt,
                primary: primary.clone(),
                secondary: None,
                mask: None,
            };
            let result = self.attempt_stage(&request);
            match &result {
                Ok(stage) => self.emit(
                    "fan_out_style_finished",
                    json!({
                        "style": preset.key,
                        "record_id": stage.record_id,
                    }),
                ),
                Err(err) => self.emit(
                    "fan_out_style_failed",
                    json!({
                        "style": preset.key,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                ),
            }
            outcomes.push(StyleOutcome {
                style: preset.key.clone(),
                result,
            });
        }

        let succeeded = outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count();
        self.emit(
            "fan_out_finished",
            json!({
                "succeeded": succeeded,
                "failed": outcomes.len() - succeeded,
            }),
        );
        Ok(outcomes)
    }

    /// Run stages back to back, feeding each stage's output into the next as
    /// its primary input. Stops at the first failure and returns the last
    /// successful result, if any.
    pub fn chain_automated(
        &self,
        start: &InputItem,
        stages: &[ChainedStage],
    ) -> Result<Option<StageResult>, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::Validation(
                "automated chain requires at least one stage".to_string(),
            ));
        }
        self.emit(
            "chain_started",
            json!({
                "stages": stages.len(),
                "source": start.display_name,
            }),
        );

        let mut current = start.clone();
        let mut last = None;
        let mut completed = 0usize;
        for stage in stages {
            let request = StageRequest {
                stage_id: stage.stage_id.clone(),
                prompt: stage.prompt.clone(),
                primary: current.clone(),
                secondary: stage.secondary.clone(),
                mask: None,
            };
            match self.run_stage(&request) {
                Ok(result) => {
                    current = InputItem::new(result.image.clone(), current.display_name.clone());
                    last = Some(result);
                    completed += 1;
                }
                Err(err) => {
                    self.emit(
                        "chain_stopped",
                        json!({
                            "stage": stage.stage_id,
                            "completed": completed,
                            "kind": err.kind(),
                            "error": err.to_string(),
                        }),
                    );
                    return Ok(last);
                }
            }
        }
        self.emit("chain_finished", json!({ "completed": completed }));
        Ok(last)
    }

    /// Apply one prompt to every input item independently.
    pub fn run_batch(
        &self,
        stage_id: &str,
        prompt: &str,
        items: &[InputItem],
    ) -> Result<BatchSummary, EngineError> {
        if items.is_empty() {
            return Err(EngineError::Validation(
                "batch run requires at least one input image".to_string(),
            ));
        }
        let _guard = self.acquire_stage(stage_id)?;
        self.emit(
            "batch_started",
            json!({
                "stage": stage_id,
                "count": items.len(),
            }),
        );

        let mut summary = BatchSummary::default();
        for item in items {
            let request = StageRequest {
                stage_id: stage_id.to_string(),
                prompt: prompt.to_string(),
                primary: item.clone(),
                secondary: None,
                mask: None,
            };
            match self.attempt_stage(&request) {
                Ok(result) => {
                    summary.success_count += 1;
                    self.emit(
                        "batch_item_finished",
                        json!({
                            "stage": stage_id,
                            "source": item.display_name,
                            "record_id": result.record_id,
                        }),
                    );
                }
                Err(err) => {
                    summary.fail_count += 1;
                    self.emit(
                        "batch_item_failed",
                        json!({
                            "stage": stage_id,
                            "source": item.display_name,
                            "kind": err.kind(),
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
        self.emit(
            "batch_finished",
            json!({
                "stage": stage_id,
                "succeeded": summary.success_count,
                "failed": summary.fail_count,
            }),
        );
        Ok(summary)
    }

    /// Generate a video, streaming coarse progress into the event log.
    pub fn run_video(&self, request: &VideoRequest) -> Result<VideoOutcome, EngineError> {
        let _guard = self.acquire_stage(VIDEO_STAGE)?;
        self.emit(
            "video_started",
            json!({
                "prompt": truncate_text(&request.prompt, 160),
                "has_image": request.image.is_some(),
            }),
        );

        let events = self.events.clone();
        let mut on_progress = |message: &str| {
            let _ = events.emit("video_progress", map_object(json!({ "message": message })));
        };
        let video = match self.client.generate_video(
            &request.prompt,
            request.image.as_ref().map(|item| &item.data),
            request.aspect_ratio,
            &mut on_progress,
        ) {
            Ok(video) => video,
            Err(err) => {
                self.emit(
                    "video_failed",
                    json!({
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                );
                return Err(err);
            }
        };

        let source_filename = request
            .image
            .as_ref()
            .map(|item| item.display_name.clone());
        let (record_id, save_error) = self.save(NewGeneration {
            video: Some(video.clone()),
            text: Some(request.prompt.trim().to_string()),
            original_filename: source_filename.clone(),
            ..Default::default()
        });
        self.emit(
            "video_finished",
            json!({
                "record_id": record_id,
                "persisted": record_id.is_some(),
                "bytes": video.len(),
            }),
        );
        Ok(VideoOutcome {
            video,
            record_id,
            save_error,
            source_filename,
        })
    }

    fn attempt_stage(&self, request: &StageRequest) -> Result<StageResult, EngineError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        let mut inputs = vec![request.primary.data.clone()];
        if let Some(secondary) = &request.secondary {
            inputs.push(secondary.clone());
        }
        let outcome = self
            .client
            .edit_image(prompt, &inputs, request.mask.as_ref())?;
        let image = self.apply_watermark(&outcome.image)?;
        let (record_id, save_error) = self.save(NewGeneration {
            image: Some(image.clone()),
            text: outcome.text.clone(),
            original_filename: Some(request.primary.display_name.clone()),
            ..Default::default()
        });
        Ok(StageResult {
            image,
            intermediate: None,
            text: outcome.text,
            source_filename: Some(request.primary.display_name.clone()),
            record_id,
            save_error,
        })
    }

    fn attempt_two_step(
        &self,
        request: &StageRequest,
        step_two_prompt: &str,
    ) -> Result<StageResult, EngineError> {
        let prompt = request.prompt.trim();
        let step_two_prompt = step_two_prompt.trim();
        if prompt.is_empty() || step_two_prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }

        let first = self.client.edit_image(
            prompt,
            std::slice::from_ref(&request.primary.data),
            request.mask.as_ref(),
        )?;
        let intermediate = first.image;

        let mut second_inputs = vec![intermediate.clone()];
        if let Some(secondary) = &request.secondary {
            second_inputs.push(resize_to_match(secondary, &request.primary.data)?);
        }
        let second = self
            .client
            .edit_image(step_two_prompt, &second_inputs, None)?;

        let image = self.apply_watermark(&second.image)?;
        let (record_id, save_error) = self.save(NewGeneration {
            image: Some(image.clone()),
            secondary_image: Some(intermediate.clone()),
            text: second.text.clone(),
            original_filename: Some(request.primary.display_name.clone()),
            ..Default::default()
        });
        Ok(StageResult {
            image,
            intermediate: Some(intermediate),
            text: second.text,
            source_filename: Some(request.primary.display_name.clone()),
            record_id,
            save_error,
        })
    }

    fn attempt_generate(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<StageResult, EngineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        let image = self.client.generate_image(prompt, aspect_ratio)?;
        let image = self.apply_watermark(&image)?;
        let (record_id, save_error) = self.save(NewGeneration {
            image: Some(image.clone()),
            text: Some(prompt.to_string()),
            ..Default::default()
        });
        Ok(StageResult {
            image,
            intermediate: None,
            text: None,
            source_filename: None,
            record_id,
            save_error,
        })
    }

    fn acquire_stage(&self, stage_id: &str) -> Result<StageGuard<'_>, EngineError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| EngineError::Generation("pipeline state lock poisoned".to_string()))?;
        if !in_flight.insert(stage_id.to_string()) {
            return Err(EngineError::Validation(format!(
                "stage '{stage_id}' is already running"
            )));
        }
        Ok(StageGuard {
            pipeline: self,
            stage_id: stage_id.to_string(),
        })
    }

    fn apply_watermark(&self, image: &ImageData) -> Result<ImageData, EngineError> {
        match &self.watermark {
            Some(text) => stamp_watermark(image, text),
            None => Ok(image.clone()),
        }
    }

    fn save(&self, new: NewGeneration) -> (Option<i64>, Option<String>) {
        match self.history.append(&new) {
            Ok(record) => (Some(record.id), None),
            Err(err) => {
                let err = EngineError::Persistence(format!("{err:#}"));
                self.emit(
                    "history_write_failed",
                    json!({ "kind": err.kind(), "error": err.to_string() }),
                );
                (None, Some(err.to_string()))
            }
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, map_object(payload));
    }
}

/// Stamp `text` in the bottom-right corner over a darkened band. Images too
/// small to fit the text are returned untouched.
pub fn stamp_watermark(image: &ImageData, text: &str) -> Result<ImageData, EngineError> {
    let decoded = image::load_from_memory(&image.bytes)
        .map_err(|err| EngineError::Generation(format!("image decode failed: {err}")))?;
    let mut canvas = decoded.to_rgba8();
    let (width, height) = canvas.dimensions();

    let scale = (width / 256).max(1);
    let glyph_w = 6 * scale;
    let glyph_h = 7 * scale;
    let pad = 2 * scale;
    let text_w = glyph_w * text.chars().count() as u32;
    if text_w + 2 * pad > width || glyph_h + 2 * pad > height {
        return Ok(image.clone());
    }

    let band_x0 = width - text_w - 2 * pad;
    let band_y0 = height - glyph_h - 2 * pad;
    for y in band_y0..height {
        for x in band_x0..width {
            let pixel = canvas.get_pixel_mut(x, y);
            pixel.0[0] = (f32::from(pixel.0[0]) * 0.45) as u8;
            pixel.0[1] = (f32::from(pixel.0[1]) * 0.45) as u8;
            pixel.0[2] = (f32::from(pixel.0[2]) * 0.45) as u8;
        }
    }

    let mut pen_x = band_x0 + pad;
    let pen_y = band_y0 + pad;
    for ch in text.chars() {
        if let Some(rows) = glyph_rows(ch.to_ascii_uppercase()) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..5u32 {
                    if bits & (1 << (4 - col)) == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let x = pen_x + col * scale + dx;
                            let y = pen_y + row as u32 * scale + dy;
                            if x < width && y < height {
                                canvas.put_pixel(x, y, Rgba([255, 255, 255, 255]));
                            }
                        }
                    }
                }
            }
        }
        pen_x += glyph_w;
    }

    encode_png(&DynamicImage::ImageRgba8(canvas))
}

/// Resize `image` to the exact dimensions of `reference`. Returns the input
/// unchanged when the dimensions already match.
pub fn resize_to_match(image: &ImageData, reference: &ImageData) -> Result<ImageData, EngineError> {
    let decoded = image::load_from_memory(&image.bytes)
        .map_err(|err| EngineError::Generation(format!("image decode failed: {err}")))?;
    let target = image::load_from_memory(&reference.bytes)
        .map_err(|err| EngineError::Generation(format!("image decode failed: {err}")))?;
    if decoded.width() == target.width() && decoded.height() == target.height() {
        return Ok(image.clone());
    }
    let resized = decoded.resize_exact(target.width(), target.height(), FilterType::Lanczos3);
    encode_png(&resized)
}

fn encode_png(image: &DynamicImage) -> Result<ImageData, EngineError> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|err| EngineError::Generation(format!("image encode failed: {err}")))?;
    Ok(ImageData::png(out))
}

// 5x7 bitmap font, one byte per row, low 5 bits used.
fn glyph_rows(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0x0e, 0x11, 0x11, 0x1f, 0x11, 0x11, 0x11],
        'B' => [0x1e, 0x11, 0x11, 0x1e, 0x11, 0x11, 0x1e],
        'C' => [0x0e, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0e],
        'D' => [0x1e, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1e],
        'E' => [0x1f, 0x10, 0x10, 0x1e, 0x10, 0x10, 0x1f],
        'F' => [0x1f, 0x10, 0x10, 0x1e, 0x10, 0x10, 0x10],
        'G' => [0x0e, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0f],
        'H' => [0x11, 0x11, 0x11, 0x1f, 0x11, 0x11, 0x11],
        'I' => [0x0e, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0e],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0c],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1f],
        'M' => [0x11, 0x1b, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0e, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0e],
        'P' => [0x1e, 0x11, 0x11, 0x1e, 0x10, 0x10, 0x10],
        'Q' => [0x0e, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0d],
        'R' => [0x1e, 0x11, 0x11, 0x1e, 0x14, 0x12, 0x11],
        'S' => [0x0f, 0x10, 0x10, 0x0e, 0x01, 0x01, 0x1e],
        'T' => [0x1f, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0e],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x0a, 0x0a, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x1b, 0x11],
        'X' => [0x11, 0x11, 0x0a, 0x04, 0x0a, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0a, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1f, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1f],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}

fn masked_prompt(prompt: &str) -> String {
    format!(
        "Apply the following instruction only to the masked area of the image: \"{prompt}\". \
         Preserve the unmasked area."
    )
}

fn inline_image_part(image: &ImageData) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.base64(),
        }
    })
}

fn find_video_uri(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["uri", "videoUri"] {
                if let Some(uri) = map.get(key).and_then(Value::as_str) {
                    if uri.starts_with("http") {
                        return Some(uri.to_string());
                    }
                }
            }
            map.values().find_map(find_video_uri)
        }
        Value::Array(rows) => rows.iter().find_map(find_video_uri),
        _ => None,
    }
}

fn response_json(response: HttpResponse) -> Result<Value, EngineError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| EngineError::Transient(format!("response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(normalize_api_error(code, &body));
    }
    serde_json::from_str(&body).map_err(|_| {
        EngineError::Generation(format!(
            "invalid JSON payload: {}",
            truncate_text(&body, 512)
        ))
    })
}

/// Translate an API error body into a user-facing message. Rate limits and
/// server-side faults map to stable retryable messages; everything else
/// passes the upstream message through.
fn normalize_api_error(http_status: u16, body: &str) -> EngineError {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(error) = parsed.get("error").and_then(Value::as_object) {
            let status = error
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
            if status == "RESOURCE_EXHAUSTED" || code == 429 {
                return EngineError::Transient(RATE_LIMIT_MESSAGE.to_string());
            }
            if code == 500 || status == "UNKNOWN" || status == "INTERNAL" {
                return EngineError::Transient(SERVER_ERROR_MESSAGE.to_string());
            }
            if let Some(message) = error.get("message").and_then(Value::as_str) {
                if !message.trim().is_empty() {
                    return EngineError::Generation(message.to_string());
                }
            }
        }
    }
    let text = truncate_text(body.trim(), 512);
    if http_status >= 500 {
        EngineError::Transient(text)
    } else {
        EngineError::Generation(text)
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() {
        EngineError::Transient(format!("request failed: {err}"))
    } else {
        EngineError::Generation(format!("request failed: {err}"))
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Arc;

    use atelier_contracts::catalog::{style_presets, TransformationCatalog};

    use super::*;

    fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> ImageData {
        let mut canvas = RgbaImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([rgb[0], rgb[1], rgb[2], 255]);
        }
        encode_png(&DynamicImage::ImageRgba8(canvas)).unwrap()
    }

    fn test_pipeline(client: Box<dyn GenerationClient>) -> (Pipeline, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(temp.path().join("history.sqlite")).unwrap();
        let events = EventLog::new(temp.path().join("events.jsonl"), "session-test");
        (Pipeline::new(client, history, events), temp)
    }

    fn stage_request(stage_id: &str, prompt: &str) -> StageRequest {
        StageRequest {
            stage_id: stage_id.to_string(),
            prompt: prompt.to_string(),
            primary: InputItem::new(solid_png(64, 64, [200, 10, 10]), "portrait.png"),
            secondary: None,
            mask: None,
        }
    }

    #[derive(Default)]
    struct ScriptedClient {
        edits: Mutex<VecDeque<Result<EditOutcome, EngineError>>>,
        generates: Mutex<VecDeque<Result<ImageData, EngineError>>>,
        videos: Mutex<VecDeque<Result<Vec<u8>, EngineError>>>,
        prompts: Mutex<Vec<String>>,
        inputs: Mutex<Vec<Vec<ImageData>>>,
    }

    impl ScriptedClient {
        fn with_edits(results: Vec<Result<EditOutcome, EngineError>>) -> Self {
            Self {
                edits: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn edit_ok(image: ImageData) -> Result<EditOutcome, EngineError> {
            Ok(EditOutcome { image, text: None })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl GenerationClient for ScriptedClient {
        fn edit_image(
            &self,
            prompt: &str,
            inputs: &[ImageData],
            _mask: Option<&ImageData>,
        ) -> Result<EditOutcome, EngineError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.inputs.lock().unwrap().push(inputs.to_vec());
            self.edits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Generation("script exhausted".to_string())))
        }

        fn generate_image(
            &self,
            prompt: &str,
            _aspect_ratio: AspectRatio,
        ) -> Result<ImageData, EngineError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.generates
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Generation("script exhausted".to_string())))
        }

        fn generate_video(
            &self,
            prompt: &str,
            _image: Option<&ImageData>,
            _aspect_ratio: AspectRatio,
            on_progress: &mut dyn FnMut(&str),
        ) -> Result<Vec<u8>, EngineError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            on_progress("Rendering video...");
            self.videos
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Generation("script exhausted".to_string())))
        }
    }

    /// Delegates to a shared script so tests can inspect the call log after
    /// handing the client to a pipeline.
    struct SharedClient(Arc<ScriptedClient>);

    impl GenerationClient for SharedClient {
        fn edit_image(
            &self,
            prompt: &str,
            inputs: &[ImageData],
            mask: Option<&ImageData>,
        ) -> Result<EditOutcome, EngineError> {
            self.0.edit_image(prompt, inputs, mask)
        }

        fn generate_image(
            &self,
            prompt: &str,
            aspect_ratio: AspectRatio,
        ) -> Result<ImageData, EngineError> {
            self.0.generate_image(prompt, aspect_ratio)
        }

        fn generate_video(
            &self,
            prompt: &str,
            image: Option<&ImageData>,
            aspect_ratio: AspectRatio,
            on_progress: &mut dyn FnMut(&str),
        ) -> Result<Vec<u8>, EngineError> {
            self.0
                .generate_video(prompt, image, aspect_ratio, on_progress)
        }
    }

    /// Blocks every edit until the test sends a release on the channel.
    struct GatedClient {
        gate: Mutex<Receiver<()>>,
    }

    impl GatedClient {
        fn new() -> (Self, Sender<()>) {
            let (tx, rx) = channel();
            (
                Self {
                    gate: Mutex::new(rx),
                },
                tx,
            )
        }
    }

    impl GenerationClient for GatedClient {
        fn edit_image(
            &self,
            prompt: &str,
            _inputs: &[ImageData],
            _mask: Option<&ImageData>,
        ) -> Result<EditOutcome, EngineError> {
            self.gate.lock().unwrap().recv().ok();
            Ok(EditOutcome {
                image: solid_png(64, 64, [0, 0, 200]),
                text: Some(prompt.to_string()),
            })
        }

        fn generate_image(
            &self,
            _prompt: &str,
            _aspect_ratio: AspectRatio,
        ) -> Result<ImageData, EngineError> {
            Err(EngineError::Generation("not scripted".to_string()))
        }

        fn generate_video(
            &self,
            _prompt: &str,
            _image: Option<&ImageData>,
            _aspect_ratio: AspectRatio,
            _on_progress: &mut dyn FnMut(&str),
        ) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Generation("not scripted".to_string()))
        }
    }

    #[test]
    fn run_stage_persists_watermarked_result() {
        let client = ScriptedClient::with_edits(vec![ScriptedClient::edit_ok(solid_png(
            64,
            64,
            [10, 200, 10],
        ))]);
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        let result = pipeline
            .run_stage(&stage_request("plushie", "make it plush"))
            .unwrap();
        assert!(result.persisted());
        assert!(result.save_error.is_none());
        assert_eq!(result.source_filename.as_deref(), Some("portrait.png"));

        let records = pipeline.history().list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].image.as_ref(), Some(&result.image));
        assert_eq!(records[0].original_filename.as_deref(), Some("portrait.png"));

        // Watermark band darkens the bottom-right corner.
        let decoded = image::load_from_memory(&result.image.bytes)
            .unwrap()
            .to_rgba8();
        assert_eq!(decoded.dimensions(), (64, 64));
        let untouched = decoded.get_pixel(0, 0);
        let stamped = decoded.get_pixel(63, 63);
        assert_ne!(untouched, stamped);
    }

    #[test]
    fn run_stage_rejects_empty_prompt_before_calling_out() {
        let script = Arc::new(ScriptedClient::default());
        let (pipeline, _temp) = test_pipeline(Box::new(SharedClient(Arc::clone(&script))));

        let err = pipeline
            .run_stage(&stage_request("plushie", "   "))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(pipeline.history().count().unwrap(), 0);
        assert!(script.prompts().is_empty());
    }

    #[test]
    fn concurrent_requests_for_same_stage_are_rejected() {
        let (client, release) = GatedClient::new();
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        thread::scope(|scope| {
            let first = scope.spawn(|| pipeline.run_stage(&stage_request("figurine", "first")));
            thread::sleep(Duration::from_millis(100));

            let busy = pipeline
                .run_stage(&stage_request("figurine", "second"))
                .unwrap_err();
            assert_eq!(busy.kind(), "validation");
            assert!(busy.to_string().contains("figurine"));

            release.send(()).unwrap();
            assert!(first.join().unwrap().is_ok());
        });

        // Guard released after the stage finished.
        release.send(()).ok();
        assert!(pipeline
            .run_stage(&stage_request("figurine", "third"))
            .is_ok());
    }

    #[test]
    fn fan_out_continues_past_failures() {
        let client = ScriptedClient::with_edits(vec![
            ScriptedClient::edit_ok(solid_png(64, 64, [1, 2, 3])),
            Err(EngineError::Generation("blocked".to_string())),
            ScriptedClient::edit_ok(solid_png(64, 64, [4, 5, 6])),
        ]);
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        let presets: Vec<StylePreset> = style_presets().into_iter().take(3).collect();
        let primary = InputItem::new(solid_png(64, 64, [9, 9, 9]), "look.png");
        let outcomes = pipeline
            .run_style_fan_out(&primary, &presets, None)
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        assert_eq!(pipeline.history().count().unwrap(), 2);
    }

    #[test]
    fn fan_out_custom_preset_falls_back_to_generic_location() {
        let script = Arc::new(ScriptedClient::with_edits(vec![ScriptedClient::edit_ok(
            solid_png(64, 64, [1, 2, 3]),
        )]));
        let (pipeline, _temp) = test_pipeline(Box::new(SharedClient(Arc::clone(&script))));

        let custom: Vec<StylePreset> = style_presets()
            .into_iter()
            .filter(|preset| preset.key == "custom")
            .collect();
        let primary = InputItem::new(solid_png(64, 64, [9, 9, 9]), "look.png");
        pipeline.run_style_fan_out(&primary, &custom, None).unwrap();

        let prompts = script.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("a dramatic location"));
        assert!(!prompts[0].contains("**[LOCATION]**"));
    }

    #[test]
    fn chain_stops_at_first_failure_and_returns_last_success() {
        let client = ScriptedClient::with_edits(vec![
            ScriptedClient::edit_ok(solid_png(64, 64, [1, 2, 3])),
            Err(EngineError::Transient("rate limited".to_string())),
            ScriptedClient::edit_ok(solid_png(64, 64, [7, 7, 7])),
        ]);
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        let stages = vec![
            ChainedStage {
                stage_id: "clothing".to_string(),
                prompt: "dress the model".to_string(),
                secondary: Some(solid_png(32, 32, [5, 5, 5])),
            },
            ChainedStage {
                stage_id: "shoes".to_string(),
                prompt: "add the shoes".to_string(),
                secondary: None,
            },
            ChainedStage {
                stage_id: "stylize".to_string(),
                prompt: "editorial lighting".to_string(),
                secondary: None,
            },
        ];
        let start = InputItem::new(solid_png(64, 64, [9, 9, 9]), "model.png");
        let last = pipeline.chain_automated(&start, &stages).unwrap();

        let last = last.expect("first stage succeeded");
        assert!(last.persisted());
        // Third stage never ran.
        assert_eq!(pipeline.history().count().unwrap(), 1);
    }

    #[test]
    fn chain_feeds_each_output_into_the_next_stage() {
        let script = Arc::new(ScriptedClient::with_edits(vec![
            ScriptedClient::edit_ok(solid_png(64, 64, [1, 2, 3])),
            ScriptedClient::edit_ok(solid_png(64, 64, [4, 5, 6])),
        ]));
        let (pipeline, _temp) = test_pipeline(Box::new(SharedClient(Arc::clone(&script))));

        let start = InputItem::new(solid_png(64, 64, [9, 9, 9]), "model.png");
        let stages = vec![
            ChainedStage {
                stage_id: "clothing".to_string(),
                prompt: "dress".to_string(),
                secondary: None,
            },
            ChainedStage {
                stage_id: "shoes".to_string(),
                prompt: "shoes".to_string(),
                secondary: None,
            },
        ];
        let last = pipeline.chain_automated(&start, &stages).unwrap();
        assert!(last.is_some());

        let inputs = script.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0][0], start.data);
        // The second stage received the first stage's watermarked output.
        assert_ne!(inputs[1][0], start.data);
        assert_eq!(pipeline.history().count().unwrap(), 2);
    }

    #[test]
    fn two_step_keeps_intermediate_and_resizes_the_reference() {
        let line_art = solid_png(50, 40, [240, 240, 240]);
        let script = Arc::new(ScriptedClient::with_edits(vec![
            ScriptedClient::edit_ok(line_art.clone()),
            ScriptedClient::edit_ok(solid_png(64, 64, [90, 10, 120])),
        ]));
        let (pipeline, _temp) = test_pipeline(Box::new(SharedClient(Arc::clone(&script))));

        let request = StageRequest {
            stage_id: "color-palette".to_string(),
            prompt: "sketch it".to_string(),
            primary: InputItem::new(solid_png(100, 80, [10, 10, 10]), "photo.png"),
            secondary: Some(solid_png(20, 20, [200, 100, 50])),
            mask: None,
        };
        let result = pipeline
            .run_two_step(&request, "color it from the palette")
            .unwrap();

        assert_eq!(result.intermediate.as_ref(), Some(&line_art));

        // Step two consumed the intermediate plus the reference scaled to the
        // source dimensions.
        let inputs = script.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1][0], line_art);
        let reference = image::load_from_memory(&inputs[1][1].bytes).unwrap();
        assert_eq!((reference.width(), reference.height()), (100, 80));

        let records = pipeline.history().list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].secondary_image.as_ref(), Some(&line_art));
        assert_eq!(records[0].image.as_ref(), Some(&result.image));
    }

    #[test]
    fn batch_counts_successes_and_failures() {
        let client = ScriptedClient::with_edits(vec![
            ScriptedClient::edit_ok(solid_png(64, 64, [1, 1, 1])),
            Err(EngineError::Transient("rate limited".to_string())),
            ScriptedClient::edit_ok(solid_png(64, 64, [2, 2, 2])),
        ]);
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        let items = vec![
            InputItem::new(solid_png(64, 64, [9, 9, 9]), "a.png"),
            InputItem::new(solid_png(64, 64, [8, 8, 8]), "b.png"),
            InputItem::new(solid_png(64, 64, [7, 7, 7]), "c.png"),
        ];
        let summary = pipeline
            .run_batch("figurine", "make a figurine", &items)
            .unwrap();

        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.fail_count, 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(pipeline.history().count().unwrap(), 2);

        // Listing is newest first, so the surviving records come back in
        // reverse input order.
        let records = pipeline.history().list_all().unwrap();
        let sources: Vec<_> = records
            .iter()
            .map(|record| record.original_filename.as_deref())
            .collect();
        assert_eq!(sources, vec![Some("c.png"), Some("a.png")]);
    }

    #[test]
    fn stage_keeps_artifact_when_history_write_fails() {
        let client =
            ScriptedClient::with_edits(vec![ScriptedClient::edit_ok(solid_png(64, 64, [5, 5, 5]))]);
        let temp = tempfile::tempdir().unwrap();
        let store_dir = temp.path().join("store");
        let history = HistoryStore::open(store_dir.join("history.sqlite")).unwrap();
        let events = EventLog::new(temp.path().join("events.jsonl"), "session-test");
        let pipeline = Pipeline::new(Box::new(client), history, events);

        // Yank the database directory out from under the open connection;
        // the next insert cannot create its journal file and fails.
        fs::remove_dir_all(&store_dir).unwrap();

        let result = pipeline
            .run_stage(&stage_request("figurine", "make a figurine"))
            .unwrap();
        assert!(!result.persisted());
        assert_eq!(result.record_id, None);
        assert!(result.save_error.is_some());

        let log = fs::read_to_string(temp.path().join("events.jsonl")).unwrap();
        assert!(log.contains("history_write_failed"));
        assert!(log.contains("\"kind\":\"persistence\""));
    }

    #[test]
    fn batch_requires_input_items() {
        let client = ScriptedClient::default();
        let (pipeline, _temp) = test_pipeline(Box::new(client));
        let err = pipeline.run_batch("figurine", "prompt", &[]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn run_generate_persists_text_to_image_results() {
        let client = ScriptedClient {
            generates: Mutex::new(VecDeque::from(vec![Ok(solid_png(512, 512, [30, 30, 30]))])),
            ..Default::default()
        };
        let (pipeline, _temp) = test_pipeline(Box::new(client));

        let result = pipeline
            .run_generate("poster-concept", "a gouache poster", AspectRatio::Square)
            .unwrap();
        assert!(result.persisted());
        assert!(result.source_filename.is_none());

        let records = pipeline.history().list_all().unwrap();
        assert_eq!(records[0].text.as_deref(), Some("a gouache poster"));
    }

    #[test]
    fn run_video_persists_and_logs_progress() {
        let client = ScriptedClient {
            videos: Mutex::new(VecDeque::from(vec![Ok(vec![0xde, 0xad, 0xbe, 0xef])])),
            ..Default::default()
        };
        let (pipeline, temp) = test_pipeline(Box::new(client));

        let outcome = pipeline
            .run_video(&VideoRequest {
                prompt: "a slow pan over dunes".to_string(),
                image: Some(InputItem::new(solid_png(64, 64, [1, 1, 1]), "dunes.png")),
                aspect_ratio: AspectRatio::Landscape,
            })
            .unwrap();

        assert!(outcome.record_id.is_some());
        assert_eq!(outcome.video, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(outcome.source_filename.as_deref(), Some("dunes.png"));

        let records = pipeline.history().list_all().unwrap();
        assert_eq!(
            records[0].video.as_deref(),
            Some(&[0xde, 0xad, 0xbe, 0xef][..])
        );

        let log = fs::read_to_string(temp.path().join("events.jsonl")).unwrap();
        assert!(log.contains("video_progress"));
        assert!(log.contains("video_finished"));
    }

    #[test]
    fn catalog_prompt_drives_a_dryrun_stage() {
        let (pipeline, _temp) = test_pipeline(Box::new(DryrunClient));
        let catalog = TransformationCatalog::default();
        let spec = catalog.get("plushie").unwrap();

        let request = StageRequest {
            stage_id: spec.key.clone(),
            prompt: spec.resolve_prompt("", &Default::default()),
            primary: InputItem::new(solid_png(64, 64, [12, 34, 56]), "pet.png"),
            secondary: None,
            mask: None,
        };
        let result = pipeline.run_stage(&request).unwrap();
        assert!(result.persisted());
    }

    #[test]
    fn dryrun_output_is_deterministic_per_prompt() {
        let client = DryrunClient;
        let input = [solid_png(32, 32, [0, 0, 0])];
        let first = client.edit_image("same prompt", &input, None).unwrap();
        let second = client.edit_image("same prompt", &input, None).unwrap();
        let other = client.edit_image("different prompt", &input, None).unwrap();
        assert_eq!(first, second);
        assert_ne!(first.image, other.image);
    }

    #[test]
    fn normalize_api_error_maps_rate_limits() {
        let body =
            r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = normalize_api_error(429, body);
        assert_eq!(err, EngineError::Transient(RATE_LIMIT_MESSAGE.to_string()));
        assert!(err.is_retryable());
    }

    #[test]
    fn normalize_api_error_maps_server_faults() {
        let body =
            r#"{"error":{"code":500,"message":"Internal error encountered.","status":"INTERNAL"}}"#;
        assert_eq!(
            normalize_api_error(500, body),
            EngineError::Transient(SERVER_ERROR_MESSAGE.to_string())
        );
        let body = r#"{"error":{"code":503,"message":"boom","status":"UNKNOWN"}}"#;
        assert_eq!(
            normalize_api_error(503, body),
            EngineError::Transient(SERVER_ERROR_MESSAGE.to_string())
        );
    }

    #[test]
    fn normalize_api_error_passes_other_messages_through() {
        let body =
            r#"{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(
            normalize_api_error(400, body),
            EngineError::Generation("API key not valid.".to_string())
        );
    }

    #[test]
    fn normalize_api_error_keeps_unparsable_bodies_verbatim() {
        assert_eq!(
            normalize_api_error(400, "<html>bad request</html>"),
            EngineError::Generation("<html>bad request</html>".to_string())
        );
        assert_eq!(
            normalize_api_error(503, "upstream unavailable"),
            EngineError::Transient("upstream unavailable".to_string())
        );
    }

    #[test]
    fn masked_prompt_wraps_instruction() {
        let rewritten = masked_prompt("add freckles");
        assert!(rewritten.contains("only to the masked area"));
        assert!(rewritten.contains("\"add freckles\""));
        assert!(rewritten.contains("Preserve the unmasked area."));
    }

    #[test]
    fn extract_edit_outcome_collects_image_and_text() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "Here is your image."},
                        {"inlineData": {"mimeType": "image/png", "data": BASE64.encode([1u8, 2, 3])}},
                    ],
                },
            }],
        });
        let outcome = GeminiClient::extract_edit_outcome(&payload).unwrap();
        assert_eq!(outcome.image.bytes, vec![1, 2, 3]);
        assert_eq!(outcome.image.mime_type, "image/png");
        assert_eq!(outcome.text.as_deref(), Some("Here is your image."));
    }

    #[test]
    fn extract_edit_outcome_reports_safety_blocks_with_categories() {
        let payload = json!({
            "candidates": [{
                "finishReason": "SAFETY",
                "safetyRatings": [
                    {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "blocked": true},
                    {"category": "HARM_CATEGORY_HARASSMENT", "blocked": false},
                ],
                "content": {"parts": []},
            }],
        });
        let err = GeminiClient::extract_edit_outcome(&payload).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("safety"));
        assert!(message.contains("HARM_CATEGORY_DANGEROUS_CONTENT"));
        assert!(!message.contains("HARM_CATEGORY_HARASSMENT"));
    }

    #[test]
    fn extract_edit_outcome_surfaces_text_only_replies() {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "I cannot edit this image."}]},
            }],
        });
        let err = GeminiClient::extract_edit_outcome(&payload).unwrap_err();
        assert!(err
            .to_string()
            .contains("The model did not return an image. I cannot edit this image."));
    }

    #[test]
    fn find_video_uri_descends_into_nested_payloads() {
        let payload = json!({
            "done": true,
            "response": {
                "generateVideoResponse": {
                    "generatedSamples": [
                        {"video": {"uri": "https://example.test/video.mp4"}}
                    ],
                },
            },
        });
        assert_eq!(
            find_video_uri(&payload).as_deref(),
            Some("https://example.test/video.mp4")
        );
        assert!(find_video_uri(&json!({"uri": "not-a-link"})).is_none());
    }

    #[test]
    fn resize_to_match_adopts_reference_dimensions() {
        let image = solid_png(64, 64, [1, 2, 3]);
        let reference = solid_png(100, 80, [0, 0, 0]);
        let resized = resize_to_match(&image, &reference).unwrap();
        let decoded = image::load_from_memory(&resized.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 80));

        let unchanged = resize_to_match(&image, &solid_png(64, 64, [9, 9, 9])).unwrap();
        assert_eq!(unchanged, image);
    }

    #[test]
    fn stamp_watermark_leaves_tiny_images_untouched() {
        let tiny = solid_png(8, 8, [1, 2, 3]);
        assert_eq!(stamp_watermark(&tiny, DEFAULT_WATERMARK).unwrap(), tiny);
    }

    #[test]
    fn stamp_watermark_preserves_dimensions() {
        let image = solid_png(300, 200, [120, 120, 120]);
        let stamped = stamp_watermark(&image, DEFAULT_WATERMARK).unwrap();
        let decoded = image::load_from_memory(&stamped.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (300, 200));
        assert_ne!(stamped.bytes, image.bytes);
    }

    #[test]
    fn pipeline_without_watermark_returns_raw_output() {
        let raw = solid_png(64, 64, [10, 200, 10]);
        let client = ScriptedClient::with_edits(vec![ScriptedClient::edit_ok(raw.clone())]);
        let temp = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(temp.path().join("history.sqlite")).unwrap();
        let events = EventLog::new(temp.path().join("events.jsonl"), "session-test");
        let pipeline = Pipeline::new(Box::new(client), history, events).with_watermark(None);

        let result = pipeline
            .run_stage(&stage_request("plushie", "make it plush"))
            .unwrap();
        assert_eq!(result.image, raw);
    }
}
