//! Streaming chat completion client
//!
//! [`CompletionClient::open`] returns an [`AbortHandle`] and a lazy
//! [`StreamConsumer`]. Nothing is sent until the consumer runs, so the abort
//! handle can be wired to the UI before the first byte arrives.
//!
//! While consuming, deltas are accumulated into [`Snapshot`]s which are
//! handed to a [`SnapshotSink`] at most once per throttle interval, plus one
//! forced emission when the stream ends.

pub mod accumulator;
pub mod sse;

pub use accumulator::{
    Accumulator, ContentRouting, MisfiledReasoningDetector, Snapshot, Verdict,
};
pub use sse::{Delta, SseDecoder, SseEvent};

use crate::chat::{Message, MessageContent, Role};
use crate::config::{ProviderConfig, StreamingConfig};
use crate::error::{ChatshardError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receiver of throttled snapshots
pub trait SnapshotSink: Send {
    /// Called with the full accumulated response on every emission
    fn emit(&mut self, snapshot: &Snapshot);
}

impl SnapshotSink for Vec<Snapshot> {
    fn emit(&mut self, snapshot: &Snapshot) {
        self.push(snapshot.clone());
    }
}

/// How a finished stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The body ended or the `[DONE]` sentinel arrived; holds the final snapshot
    Completed(Snapshot),
    /// The request was aborted; holds the last emitted snapshot, if any
    Aborted(Option<Snapshot>),
}

/// Cancels one in-flight completion request
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Create an untriggered handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the request or the read in progress
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// True once `abort` has been called
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Per-request streaming options
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Minimum interval between emissions
    pub throttle_interval: Duration,
    /// Detector applied before the first emission; `None` disables it
    pub misfiled_reasoning: Option<MisfiledReasoningDetector>,
    /// Where content fragments are routed
    pub routing: ContentRouting,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(100),
            misfiled_reasoning: None,
            routing: ContentRouting::Direct,
        }
    }
}

impl StreamOptions {
    /// Options for a fresh turn
    pub fn from_config(config: &StreamingConfig) -> Self {
        let misfiled = &config.misfiled_reasoning;
        Self {
            throttle_interval: config.throttle_interval(),
            misfiled_reasoning: misfiled
                .enabled
                .then(|| MisfiledReasoningDetector::new(&misfiled.prefixes)),
            routing: ContentRouting::Direct,
        }
    }

    /// Options for retrying a turn whose reasoning arrived as content
    ///
    /// Detection is off and content counts as reasoning until an end marker.
    pub fn for_restart(config: &StreamingConfig) -> Self {
        Self {
            throttle_interval: config.throttle_interval(),
            misfiled_reasoning: None,
            routing: ContentRouting::ReasoningUntil(
                config.misfiled_reasoning.end_markers.clone(),
            ),
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a MessageContent,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl CompletionClient {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::Provider` if the HTTP client cannot be built.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatshard::completion::CompletionClient;
    /// use chatshard::config::ProviderConfig;
    ///
    /// let client = CompletionClient::new(&ProviderConfig::default()).unwrap();
    /// assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    /// ```
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("chatshard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ChatshardError::Provider(format!("Failed to create HTTP client: {}", e))
            })?;

        let endpoint = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
        tracing::info!("Initialized completion client: endpoint={}, model={}", endpoint, config.model);

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    /// Full URL requests are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Prepare a streaming request for `messages`
    ///
    /// Returns immediately; the request is sent when the consumer runs.
    pub fn open(&self, messages: &[Message], options: StreamOptions) -> (AbortHandle, StreamConsumer) {
        let body = CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role,
                    content: &message.content,
                })
                .collect(),
            stream: true,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        tracing::debug!("Opening completion stream: {} messages", messages.len());

        let handle = AbortHandle::new();
        let consumer = StreamConsumer {
            request,
            options,
            token: handle.token(),
        };
        (handle, consumer)
    }
}

/// Lazily started reader of one completion stream
#[derive(Debug)]
pub struct StreamConsumer {
    request: reqwest::RequestBuilder,
    options: StreamOptions,
    token: CancellationToken,
}

impl StreamConsumer {
    /// Send the request and drive the stream to its end
    ///
    /// # Errors
    ///
    /// - `ChatshardError::Provider` for a non-success status
    /// - `ChatshardError::Http` for transport failures
    /// - `ChatshardError::MisfiledReasoning` when the detector trips; nothing
    ///   has been emitted in that case
    ///
    /// Aborting is not an error: it yields `StreamOutcome::Aborted`.
    pub async fn consume(self, sink: &mut dyn SnapshotSink) -> Result<StreamOutcome> {
        let Self {
            request,
            options,
            token,
        } = self;

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Completion aborted before response");
                return Ok(StreamOutcome::Aborted(None));
            }
            response = request.send() => response.map_err(ChatshardError::from)?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Completion endpoint returned error {}: {}", status, error_text);
            return Err(ChatshardError::Provider(format!(
                "Completion endpoint returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ChatshardError::from));
        pump(body, options, token, sink).await
    }
}

/// Emission gate: throttle state plus the one-shot misfiled check
struct Emitter<'s> {
    sink: &'s mut dyn SnapshotSink,
    interval: Duration,
    last_emission: Option<Instant>,
    deadline: Option<Instant>,
    detector: Option<MisfiledReasoningDetector>,
    emitted: Option<Snapshot>,
}

impl Emitter<'_> {
    /// Apply the misfiled check while it is still active
    fn gate(&mut self, snapshot: &Snapshot) -> Result<bool> {
        let Some(detector) = &self.detector else {
            return Ok(true);
        };
        match detector.check(snapshot) {
            Verdict::Clear => Ok(true),
            Verdict::Withhold => Ok(false),
            Verdict::Misfiled(marker) => {
                tracing::info!(marker = %marker, "Reasoning detected in answer content");
                Err(ChatshardError::MisfiledReasoning { marker }.into())
            }
        }
    }

    fn on_change(&mut self, snapshot: &Snapshot) -> Result<()> {
        if !self.gate(snapshot)? || self.deadline.is_some() {
            return Ok(());
        }
        let now = Instant::now();
        match self.last_emission {
            Some(last) if now.duration_since(last) >= self.interval => self.emit(snapshot, now),
            Some(last) => self.deadline = Some(last + self.interval),
            // The window opens with the first delta, not with the request.
            None => self.deadline = Some(now + self.interval),
        }
        Ok(())
    }

    fn emit(&mut self, snapshot: &Snapshot, now: Instant) {
        self.sink.emit(snapshot);
        self.last_emission = Some(now);
        self.deadline = None;
        self.detector = None;
        self.emitted = Some(snapshot.clone());
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive a body stream through decoding, accumulation and throttling
async fn pump<S, E>(
    body: S,
    options: StreamOptions,
    token: CancellationToken,
    sink: &mut dyn SnapshotSink,
) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<anyhow::Error>,
{
    tokio::pin!(body);

    let mut decoder = SseDecoder::new();
    let mut accumulator = Accumulator::new(options.routing);
    let mut emitter = Emitter {
        sink,
        interval: options.throttle_interval,
        last_emission: None,
        deadline: None,
        detector: options.misfiled_reasoning,
        emitted: None,
    };

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Completion stream aborted");
                return Ok(StreamOutcome::Aborted(emitter.emitted));
            }
            _ = sleep_until_deadline(emitter.deadline) => {
                let snapshot = accumulator.snapshot().clone();
                if emitter.gate(&snapshot)? {
                    emitter.emit(&snapshot, Instant::now());
                } else {
                    emitter.deadline = None;
                }
            }
            chunk = body.next() => {
                let Some(chunk) = chunk else {
                    if let Some(event) = decoder.finish() {
                        apply_event(event, &mut accumulator);
                    }
                    break;
                };
                let chunk = chunk.map_err(Into::into)?;

                let mut changed = false;
                let mut done = false;
                for event in decoder.push(&chunk) {
                    if matches!(event, SseEvent::Done) {
                        done = true;
                        break;
                    }
                    changed |= apply_event(event, &mut accumulator);
                }
                if changed {
                    emitter.on_change(accumulator.snapshot())?;
                }
                if done {
                    break;
                }
            }
        }
    }

    // Stream end: drop any armed timer and emit unconditionally, even when
    // the detector is still undecided.
    let snapshot = accumulator.snapshot().clone();
    emitter.gate(&snapshot)?;
    emitter.emit(&snapshot, Instant::now());
    tracing::debug!(
        content_len = snapshot.content.len(),
        reasoning_len = snapshot.reasoning_content.len(),
        "Completion stream finished"
    );
    Ok(StreamOutcome::Completed(snapshot))
}

fn apply_event(event: SseEvent, accumulator: &mut Accumulator) -> bool {
    match event {
        SseEvent::Delta(delta) => accumulator.push(&delta),
        SseEvent::Done => false,
        SseEvent::Malformed(detail) => {
            let error = ChatshardError::MalformedChunk(detail);
            tracing::warn!("Skipping stream line: {}", error);
            false
        }
    }
}
