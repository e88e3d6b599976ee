use std::sync::Arc;
use std::time::Instant;

use banana_contracts::events::{EventLog, GenerationEvent};
use banana_contracts::history::BatchProgress;
use banana_contracts::GenerateError;
use tokio::sync::{watch, Mutex};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ImageCache, StoreOutcome};
use crate::codec;
use crate::config::{ConfigError, EngineConfig, GenerationLimits};
use crate::gemini;
use crate::rate_limit::RateLimiter;
use crate::transport::{HttpTransport, Transport};

/// One image out of a batch, tagged with the position of its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchImage {
    pub index: usize,
    pub image: Vec<u8>,
}

/// Entry point for every generation: validation, cache, rate limiting,
/// transport and parsing, in that order.
///
/// At most one network call is in flight per generator; cache hits never wait.
pub struct Generator {
    transport: Arc<dyn Transport>,
    cache: Arc<ImageCache>,
    limiter: Arc<RateLimiter>,
    limits: GenerationLimits,
    in_flight: Mutex<()>,
    progress: watch::Sender<BatchProgress>,
    events: Option<EventLog>,
}

impl Generator {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ImageCache>,
        limiter: Arc<RateLimiter>,
        limits: GenerationLimits,
    ) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            transport,
            cache,
            limiter,
            limits,
            in_flight: Mutex::new(()),
            progress,
            events: None,
        }
    }

    /// Production wiring: reqwest transport, on-disk cache, configured interval.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(
            Arc::new(transport),
            Arc::new(ImageCache::open(&config.cache_dir, config.cache_limits)),
            Arc::new(RateLimiter::new(config.min_request_interval)),
            config.limits,
        ))
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Live batch progress; the latest value is always readable.
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    /// Checks the prompt and input image. Returns the JPEG that would be sent.
    pub fn validate(
        &self,
        prompt: &str,
        input_image: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, GenerateError> {
        if prompt.trim().is_empty() {
            return Err(GenerateError::InvalidRequest);
        }
        if prompt.chars().count() > self.limits.max_prompt_chars {
            return Err(GenerateError::PromptTooLong);
        }
        let Some(image) = input_image else {
            return Ok(None);
        };
        let jpeg = codec::reencode_jpeg(image, self.limits.jpeg_quality)?;
        if jpeg.len() > self.limits.max_image_bytes {
            return Err(GenerateError::ImageTooLarge);
        }
        Ok(Some(jpeg))
    }

    pub async fn generate(
        &self,
        prompt: &str,
        input_image: Option<&[u8]>,
    ) -> Result<Vec<u8>, GenerateError> {
        let result = self.generate_inner(prompt, input_image).await;
        if let Err(err) = &result {
            self.emit(GenerationEvent::GenerationFailed {
                error_kind: err.kind().to_string(),
                message: err.user_message(),
            })
            .await;
        }
        result
    }

    async fn generate_inner(
        &self,
        prompt: &str,
        input_image: Option<&[u8]>,
    ) -> Result<Vec<u8>, GenerateError> {
        let jpeg = self.validate(prompt, input_image)?;
        let key = CacheKey::new(prompt, input_image);
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }

        let _permit = self.in_flight.lock().await;
        // an identical request may have finished while we queued
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }

        self.emit(GenerationEvent::GenerationStarted {
            cache_key: key.to_string(),
            prompt_chars: prompt.chars().count(),
            has_input_image: jpeg.is_some(),
        })
        .await;
        let waited = self.limiter.await_turn().await;
        info!(
            key = %key,
            has_input_image = jpeg.is_some(),
            waited_ms = waited.as_millis() as u64,
            "cache miss; calling Gemini"
        );

        let started = Instant::now();
        let payload = gemini::build_payload(prompt, jpeg.as_deref());
        let response = self.transport.post(&payload).await.map_err(|err| {
            warn!(error = %err, "Gemini transport failed");
            err.classify()
        })?;
        let image = gemini::parse_response(response.status, &response.body)?;
        let latency = started.elapsed();

        self.store(&key, &image).await;
        info!(key = %key, bytes = image.len(), latency_ms = latency.as_millis() as u64, "image generated");
        self.emit(GenerationEvent::GenerationSucceeded {
            cache_key: key.to_string(),
            bytes: image.len(),
            latency_ms: latency.as_millis(),
        })
        .await;
        Ok(image)
    }

    /// Runs every prompt in order, pairing `prompts[i]` with
    /// `input_images[i]` when present. Failed items are logged and skipped;
    /// cancellation stops before the next item and keeps what was produced.
    pub async fn batch_generate(
        &self,
        prompts: &[String],
        input_images: &[Option<Vec<u8>>],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchImage>, GenerateError> {
        if prompts.is_empty() {
            return Err(GenerateError::InvalidRequest);
        }
        let total = prompts.len();
        self.progress.send_replace(BatchProgress::new(total));

        let mut produced = Vec::new();
        let mut cancelled = false;
        for (index, prompt) in prompts.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(index, total, "batch cancelled");
                cancelled = true;
                break;
            }
            let input = input_images.get(index).and_then(Option::as_deref);
            match self.generate(prompt, input).await {
                Ok(image) => produced.push(BatchImage { index, image }),
                Err(err) => {
                    warn!(item = index + 1, total, error = %err, "batch item failed; skipping");
                    self.emit(GenerationEvent::BatchItemSkipped {
                        index,
                        total,
                        error_kind: err.kind().to_string(),
                    })
                    .await;
                }
            }
            self.progress.send_modify(|progress| progress.completed = index + 1);
        }

        debug!(produced = produced.len(), total, cancelled, "batch finished");
        self.emit(GenerationEvent::BatchFinished {
            produced: produced.len(),
            total,
            cancelled,
        })
        .await;
        Ok(produced)
    }

    /// Generates from `initial_prompt`, then feeds each output into the next
    /// edit prompt. The first failure aborts the chain.
    pub async fn iterative_edit(
        &self,
        initial_prompt: &str,
        edit_prompts: &[String],
        input_image: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, GenerateError> {
        let steps = edit_prompts.len() + 1;
        if cancel.is_cancelled() {
            return Err(GenerateError::Cancelled);
        }
        let first = self.generate(initial_prompt, input_image).await?;
        self.emit(GenerationEvent::EditStepFinished { step: 1, steps })
        .await;

        let mut results = vec![first];
        for (idx, edit_prompt) in edit_prompts.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(step = idx + 2, steps, "iterative edit cancelled");
                return Err(GenerateError::Cancelled);
            }
            let next = {
                let previous = results.last().map(Vec::as_slice);
                self.generate(edit_prompt, previous).await?
            };
            results.push(next);
            self.emit(GenerationEvent::EditStepFinished {
                step: idx + 2,
                steps,
            })
            .await;
        }
        Ok(results)
    }

    async fn cached(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let cache = Arc::clone(&self.cache);
        let lookup = key.clone();
        let hit = match task::spawn_blocking(move || cache.lookup_key(&lookup)).await {
            Ok(hit) => hit?,
            Err(err) => {
                warn!(key = %key, error = %err, "cache lookup task failed; treating as miss");
                return None;
            }
        };
        debug!(key = %key, bytes = hit.len(), "cache hit");
        self.emit(GenerationEvent::CacheHit {
            cache_key: key.to_string(),
            bytes: hit.len(),
        })
        .await;
        Some(hit)
    }

    async fn store(&self, key: &CacheKey, image: &[u8]) {
        let cache = Arc::clone(&self.cache);
        let (entry_key, bytes) = (key.clone(), image.to_vec());
        match task::spawn_blocking(move || cache.store_key(&entry_key, &bytes)).await {
            Ok(StoreOutcome::Stored) => {}
            Ok(StoreOutcome::MemoryOnly(err)) => {
                warn!(key = %key, error = %err, "cache disk write failed; result kept in memory only");
            }
            Err(err) => warn!(key = %key, error = %err, "cache store task failed"),
        }
    }

    async fn emit(&self, event: GenerationEvent) {
        let Some(events) = self.events.clone() else {
            return;
        };
        match task::spawn_blocking(move || events.record(&event)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "event log write failed"),
            Err(err) => warn!(error = %err, "event log task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use banana_contracts::wire::{GenerateContentRequest, RequestPart};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::*;
    use crate::config::CacheLimits;
    use crate::transport::{TransportError, TransportResponse};

    /// Answers by prompt: prompts listed in `failures` get the paired status,
    /// everything else gets a solid PNG whose colour depends on the call count.
    /// Tracks how many posts overlap; `cancel_during_first` fires inside call 1.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: Vec<(String, u16)>,
        timeouts: Vec<String>,
        delay: Duration,
        cancel_during_first: Option<CancellationToken>,
        calls: StdMutex<Vec<GenerateContentRequest>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedTransport {
        fn failing(prompt: &str, status: u16) -> Self {
            Self {
                failures: vec![(prompt.to_string(), status)],
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<GenerateContentRequest> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn prompts(&self) -> Vec<String> {
            self.calls()
                .iter()
                .filter_map(|request| prompt_of(request))
                .collect()
        }
    }

    fn prompt_of(request: &GenerateContentRequest) -> Option<String> {
        request.contents.first()?.parts.iter().find_map(|part| match part {
            RequestPart::Text { text } => Some(text.clone()),
            RequestPart::InlineData { .. } => None,
        })
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(
            &self,
            payload: &GenerateContentRequest,
        ) -> Result<TransportResponse, TransportError> {
            let call_no = {
                let mut calls = self.calls.lock().map_err(|_| TransportError::Other("poisoned".into()))?;
                calls.push(payload.clone());
                calls.len()
            };
            if call_no == 1 {
                if let Some(token) = &self.cancel_during_first {
                    token.cancel();
                }
            }
            let overlapping = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(overlapping, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let prompt = prompt_of(payload).unwrap_or_default();
            if self.timeouts.contains(&prompt) {
                return Err(TransportError::Timeout);
            }
            if let Some((_, status)) = self.failures.iter().find(|(p, _)| *p == prompt) {
                return Ok(TransportResponse {
                    status: *status,
                    body: br#"{"error":{"message":"scripted failure"}}"#.to_vec(),
                });
            }
            let colour = [(call_no as u8).wrapping_mul(40), 200, 30];
            let png = codec::solid_png(4, 4, colour).map_err(|err| TransportError::Other(err.to_string()))?;
            let body = json!({
                "candidates": [{"content": {"parts": [
                    {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(&png)}}
                ]}}]
            });
            Ok(TransportResponse {
                status: 200,
                body: serde_json::to_vec(&body).map_err(|err| TransportError::Other(err.to_string()))?,
            })
        }
    }

    fn generator_with(
        transport: Arc<ScriptedTransport>,
        dir: &std::path::Path,
        interval: Duration,
    ) -> Generator {
        Generator::new(
            transport,
            Arc::new(ImageCache::open(dir, CacheLimits::default())),
            Arc::new(RateLimiter::new(interval)),
            GenerationLimits::default(),
        )
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn second_generate_is_served_from_cache() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        let first = generator.generate("a banana", None).await?;
        let second = generator.generate("a banana", None).await?;
        assert_eq!(first, second);
        assert_eq!(transport.calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cache_hit_with_input_image_skips_network() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let input = codec::solid_png(6, 6, [1, 2, 3])?;

        generator.generate("recolour", Some(&input)).await?;
        generator.generate("recolour", Some(&input)).await?;
        generator.generate("recolour", None).await?;
        assert_eq!(transport.calls().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn misses_are_spaced_by_the_rate_limiter() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let interval = Duration::from_millis(40);
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), interval);

        let started = Instant::now();
        for prompt in ["one", "two", "three"] {
            generator.generate(prompt, None).await?;
        }
        assert!(started.elapsed() >= interval * 2);
        assert_eq!(transport.calls().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn validation_rejects_before_any_network_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let mut generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        assert_eq!(
            generator.generate(" \n\t ", None).await,
            Err(GenerateError::InvalidRequest)
        );
        assert_eq!(
            generator.generate(&"b".repeat(2001), None).await,
            Err(GenerateError::PromptTooLong)
        );
        assert!(generator.validate(&"b".repeat(2000), None).is_ok());
        assert_eq!(
            generator.generate("edit", Some(b"not an image")).await,
            Err(GenerateError::InvalidImageFormat)
        );

        generator.limits.max_image_bytes = 64;
        let input = codec::solid_png(64, 64, [90, 90, 90])?;
        assert_eq!(
            generator.generate("edit", Some(&input)).await,
            Err(GenerateError::ImageTooLarge)
        );
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn edit_request_sends_reencoded_jpeg_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let input = codec::solid_png(6, 6, [200, 10, 10])?;

        generator.generate("make it green", Some(&input)).await?;
        let calls = transport.calls();
        let parts = &calls[0].contents[0].parts;
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            RequestPart::InlineData { inline_data } => {
                assert_eq!(inline_data.mime_type, "image/jpeg");
                let sent = BASE64.decode(&inline_data.data)?;
                assert_eq!(codec::extension_for(&sent), "jpg");
            }
            RequestPart::Text { .. } => panic!("image part must come first"),
        }
        assert_eq!(parts[1], RequestPart::text("make it green"));
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_classified_and_not_cached() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::failing("locked", 401));
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        assert_eq!(
            generator.generate("locked", None).await,
            Err(GenerateError::InvalidApiKey)
        );
        assert_eq!(
            generator.generate("locked", None).await,
            Err(GenerateError::InvalidApiKey)
        );
        assert_eq!(transport.calls().len(), 2);
        assert_eq!(generator.cache().size(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transport_timeout_maps_to_rate_limit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            timeouts: strings(&["slow"]),
            ..ScriptedTransport::default()
        });
        let generator = generator_with(transport, temp.path(), Duration::ZERO);
        assert_eq!(
            generator.generate("slow", None).await,
            Err(GenerateError::RateLimitExceeded)
        );
        Ok(())
    }

    #[tokio::test]
    async fn batch_skips_failed_items_and_keeps_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::failing("b", 500));
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let progress = generator.progress();

        let images = generator
            .batch_generate(&strings(&["a", "b", "c"]), &[], &CancellationToken::new())
            .await?;
        let indices: Vec<usize> = images.iter().map(|item| item.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(transport.prompts(), strings(&["a", "b", "c"]));
        assert_eq!(*progress.borrow(), BatchProgress { completed: 3, total: 3 });
        Ok(())
    }

    #[tokio::test]
    async fn batch_pairs_inputs_by_position() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let input = codec::solid_png(6, 6, [5, 5, 5])?;

        generator
            .batch_generate(&strings(&["x", "y"]), &[Some(input)], &CancellationToken::new())
            .await?;
        let part_counts: Vec<usize> = transport
            .calls()
            .iter()
            .map(|call| call.contents[0].parts.len())
            .collect();
        assert_eq!(part_counts, vec![2, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generator = generator_with(Arc::new(ScriptedTransport::default()), temp.path(), Duration::ZERO);
        assert_eq!(
            generator.batch_generate(&[], &[], &CancellationToken::new()).await,
            Err(GenerateError::InvalidRequest)
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_returns_partial_results() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let images = generator
            .batch_generate(&strings(&["a", "b"]), &[], &cancel)
            .await?;
        assert!(images.is_empty());
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn iterative_edit_chains_previous_output() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        let images = generator
            .iterative_edit("base", &strings(&["step1", "step2"]), None, &CancellationToken::new())
            .await?;
        assert_eq!(images.len(), 3);
        assert_eq!(transport.prompts(), strings(&["base", "step1", "step2"]));

        let calls = transport.calls();
        assert_eq!(calls[0].contents[0].parts.len(), 1);
        for (step, call) in calls.iter().enumerate().skip(1) {
            let RequestPart::InlineData { inline_data } = &call.contents[0].parts[0] else {
                panic!("edit step {step} must carry the previous image");
            };
            let sent = BASE64.decode(&inline_data.data)?;
            let expected = codec::reencode_jpeg(&images[step - 1], 80)?;
            assert_eq!(sent, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn iterative_edit_aborts_on_first_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::failing("step1", 429));
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        let result = generator
            .iterative_edit("base", &strings(&["step1", "step2"]), None, &CancellationToken::new())
            .await;
        assert_eq!(result, Err(GenerateError::RateLimitExceeded));
        assert_eq!(transport.prompts(), strings(&["base", "step1"]));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_iterative_edit_fails_without_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::default());
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = generator
            .iterative_edit("base", &strings(&["step1"]), None, &cancel)
            .await;
        assert_eq!(result, Err(GenerateError::Cancelled));
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn events_are_recorded_when_configured() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let generator = generator_with(
            Arc::new(ScriptedTransport::failing("bad", 400)),
            &temp.path().join("cache"),
            Duration::ZERO,
        )
        .with_events(EventLog::new(&events_path, "session-test"));

        generator.generate("good", None).await?;
        generator.generate("good", None).await?;
        let _ = generator.generate("bad", None).await;

        let types: Vec<String> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            types,
            strings(&[
                "generation_started",
                "generation_succeeded",
                "cache_hit",
                "generation_started",
                "generation_failed",
            ])
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_generates_share_one_in_flight_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(20),
            ..ScriptedTransport::default()
        });
        let generator = Arc::new(generator_with(transport.clone(), temp.path(), Duration::ZERO));

        let handles: Vec<_> = ["p0", "p1", "p2", "p0", "p1", "p2"]
            .into_iter()
            .map(|prompt| {
                let generator = Arc::clone(&generator);
                tokio::spawn(async move { (prompt, generator.generate(prompt, None).await) })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            let (prompt, result) = handle.await?;
            results.push((prompt, result?));
        }

        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls().len(), 3);
        for (prompt, image) in &results {
            let twin = results
                .iter()
                .find(|(other, _)| other == prompt)
                .map(|(_, bytes)| bytes);
            assert_eq!(twin, Some(image));
        }
        Ok(())
    }

    #[tokio::test]
    async fn batch_stops_when_cancelled_mid_run() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cancel = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport {
            cancel_during_first: Some(cancel.clone()),
            ..ScriptedTransport::default()
        });
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        let progress = generator.progress();

        let images = generator
            .batch_generate(&strings(&["a", "b", "c"]), &[], &cancel)
            .await?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].index, 0);
        assert_eq!(transport.prompts(), strings(&["a"]));
        assert_eq!(*progress.borrow(), BatchProgress { completed: 1, total: 3 });
        Ok(())
    }

    #[tokio::test]
    async fn iterative_edit_stops_when_cancelled_mid_chain() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cancel = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport {
            cancel_during_first: Some(cancel.clone()),
            ..ScriptedTransport::default()
        });
        let generator = generator_with(transport.clone(), temp.path(), Duration::ZERO);

        let result = generator
            .iterative_edit("base", &strings(&["step1", "step2"]), None, &cancel)
            .await;
        assert_eq!(result, Err(GenerateError::Cancelled));
        assert_eq!(transport.prompts(), strings(&["base"]));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disk_tier_serves_a_fresh_generator() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = generator_with(Arc::new(ScriptedTransport::default()), temp.path(), Duration::ZERO);
        let image = first.generate("persisted", None).await?;

        let transport = Arc::new(ScriptedTransport::default());
        let second = generator_with(transport.clone(), temp.path(), Duration::ZERO);
        assert_eq!(second.generate("persisted", None).await?, image);
        assert!(transport.calls().is_empty());
        assert_eq!(second.cache().memory_len(), 1);
        Ok(())
    }
}
