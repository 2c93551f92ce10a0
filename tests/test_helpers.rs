#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_gen_dispatch::*;

type Responder =
    Box<dyn Fn(&GenerationJob, usize) -> Result<GenerationResponse, TransportError> + Send + Sync>;

/// Transport whose answers come from a closure of (job, call number).
pub struct ScriptedTransport {
    responder: Responder,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    jobs: Mutex<Vec<GenerationJob>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerationJob, usize) -> Result<GenerationResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Every job returns `image_count` images.
    pub fn succeeding() -> Self {
        Self::new(|job, _| Ok(images(job.image_count as usize)))
    }

    /// Every job fails with the given HTTP status.
    pub fn failing(status: u16) -> Self {
        Self::new(move |_, _| {
            Err(TransportError::Status {
                status,
                body: "scripted failure".to_string(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, job: &GenerationJob) -> Result<GenerationResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.responder)(job, call)
    }
}

pub fn image() -> GeneratedImage {
    GeneratedImage {
        bytes: vec![0xFF, 0xD8, 0xFF],
        mime_type: "image/jpeg".to_string(),
    }
}

pub fn images(count: usize) -> GenerationResponse {
    GenerationResponse::ok((0..count).map(|_| image()).collect())
}

/// Config with a generous rate limit and millisecond backoffs.
pub fn fast_config() -> DispatchConfigBuilder {
    DispatchConfig::builder()
        .with_rate_limit(10_000, Duration::from_secs(1), Duration::ZERO)
        .with_retry_policy(RetryPolicyConfig {
            max_retries: 2,
            backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5,
        })
}

pub fn entry(id: &str) -> QueueEntry {
    QueueEntry::new(PromptSource::Inline(format!("prompt for {}", id)), "test-model").with_id(id)
}

pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    let mut seed: u32 = 0x9E37_79B9;
    let img = RgbImage::from_fn(width, height, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let [r, g, b, _] = seed.to_le_bytes();
        Rgb([r, g, b])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Poll `condition` every few milliseconds, failing the test after 5s.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
