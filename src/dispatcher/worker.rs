use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::coordinator::{CoordinatorEvent, Outcome, WorkItem};
use crate::budget::PayloadBudgeter;
use crate::compress::ImageCompressor;
use crate::concurrency::ConcurrencyGate;
use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventSink, HeavyCompressionEvent};
use crate::rate_limiter::RateLimiter;
use crate::types::{
    GeneratedImage, GenerationJob, GenerationResponse, PreparedReference, ReferenceImage,
};
use crate::Transport;

/// Everything a worker needs, shared by the whole pool for one run.
pub(crate) struct WorkerContext<T> {
    pub transport: Arc<T>,
    pub limiter: Arc<RateLimiter>,
    pub gate: Arc<ConcurrencyGate>,
    pub budgeter: PayloadBudgeter,
    pub compressor: Arc<ImageCompressor>,
    pub prompts: Arc<HashMap<String, String>>,
    pub sink: EventSink,
    pub request_timeout: Duration,
    pub run_token: CancellationToken,
    pub outcomes: UnboundedSender<CoordinatorEvent>,
}

/// Pull items until the work channel closes.
pub(crate) async fn run_worker<T: Transport>(
    ctx: Arc<WorkerContext<T>>,
    queue: Arc<Mutex<UnboundedReceiver<WorkItem>>>,
) {
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(item) = next else {
            break;
        };

        let result = execute(&ctx, &item).await;
        let outcome = match result {
            Ok(images) => Outcome::Produced {
                entry_id: item.entry.id.clone(),
                batch_index: item.batch_index,
                images,
            },
            Err(DispatchError::Cancelled) => Outcome::Cancelled {
                entry_id: item.entry.id.clone(),
            },
            Err(error) => Outcome::Failed { item, error },
        };

        if ctx.outcomes.send(CoordinatorEvent::Finished(outcome)).is_err() {
            break;
        }
    }
}

/// One attempt: admission, reference preparation, then the provider call.
///
/// The permit is held from admission until the call returns and is
/// dropped on every path out of this function.
async fn execute<T: Transport>(
    ctx: &WorkerContext<T>,
    item: &WorkItem,
) -> Result<Vec<GeneratedImage>, DispatchError> {
    let entry = &item.entry;
    let cancel = &item.cancel;

    ctx.limiter.acquire(cancel).await?;
    let _permit = ctx.gate.acquire(cancel).await?;

    let prompt = entry.prompt.resolve(item.batch_index, &ctx.prompts)?;
    let references = prepare_references(ctx, item, prompt.len()).await?;

    // Stopped while preparing: skip the network call.
    if cancel.is_cancelled() {
        return Err(DispatchError::Cancelled);
    }

    let job = GenerationJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        entry_id: entry.id.clone(),
        batch_index: item.batch_index,
        attempt: item.attempt,
        prompt,
        model: entry.model.clone(),
        resolution: entry.resolution.clone(),
        image_count: entry.images_per_batch,
        references,
        ext_params: entry.ext_params.clone(),
    };

    tracing::debug!(
        entry_id = %job.entry_id,
        job_id = %job.job_id,
        batch = job.batch_index,
        attempt = job.attempt,
        reference_bytes = job.reference_bytes(),
        "sending generation job"
    );

    // An in-flight call survives a pause of its entry but not cancel_all.
    let response = tokio::select! {
        _ = ctx.run_token.cancelled() => return Err(DispatchError::Cancelled),
        result = tokio::time::timeout(ctx.request_timeout, ctx.transport.send(&job)) => {
            match result {
                Ok(response) => response?,
                Err(_) => return Err(DispatchError::Timeout),
            }
        }
    };

    classify(response)
}

fn classify(response: GenerationResponse) -> Result<Vec<GeneratedImage>, DispatchError> {
    if !(200..300).contains(&response.status_code) {
        return Err(DispatchError::Provider {
            status: response.status_code,
            message: "non-success status".to_string(),
        });
    }
    if response.images.is_empty() {
        return Err(DispatchError::EmptyResponse);
    }
    Ok(response.images)
}

async fn prepare_references<T>(
    ctx: &WorkerContext<T>,
    item: &WorkItem,
    prompt_bytes: usize,
) -> Result<Vec<PreparedReference>, DispatchError> {
    let references = &item.entry.references;
    let Some(budget) = ctx
        .budgeter
        .per_image_budget(references.len(), prompt_bytes)?
    else {
        return Ok(Vec::new());
    };

    let mut prepared = Vec::with_capacity(references.len());
    for reference in references {
        let bytes = load_reference(reference).await?;
        let compressor = Arc::clone(&ctx.compressor);
        let fitted = tokio::task::spawn_blocking(move || fit_reference(&compressor, bytes, budget))
            .await
            .map_err(|e| DispatchError::Reference(format!("compression task failed: {}", e)))??;

        if fitted.heavily_compressed {
            tracing::warn!(
                entry_id = %item.entry.id,
                batch = item.batch_index,
                attempts = fitted.attempts_used,
                quality = fitted.final_quality,
                dimension = fitted.final_dimension,
                "reference needed heavy compression"
            );
            ctx.sink
                .emit(DispatchEvent::HeavyCompression(HeavyCompressionEvent {
                    entry_id: item.entry.id.clone(),
                    batch: item.batch_index,
                    attempts_used: fitted.attempts_used,
                    final_quality: fitted.final_quality,
                    final_dimension: fitted.final_dimension,
                }));
        }
        prepared.push(fitted.reference);
    }
    Ok(prepared)
}

async fn load_reference(reference: &ReferenceImage) -> Result<Vec<u8>, DispatchError> {
    match reference {
        ReferenceImage::Inline { bytes } => Ok(bytes.clone()),
        ReferenceImage::Stored { path } => tokio::fs::read(path)
            .await
            .map_err(|e| DispatchError::Reference(format!("{}: {}", path.display(), e))),
    }
}

struct FittedReference {
    reference: PreparedReference,
    attempts_used: u32,
    final_quality: u8,
    final_dimension: u32,
    heavily_compressed: bool,
}

/// Forward a reference untouched when it already fits, otherwise compress
/// it down to `budget`.
fn fit_reference(
    compressor: &ImageCompressor,
    bytes: Vec<u8>,
    budget: usize,
) -> Result<FittedReference, DispatchError> {
    let (width, height) = image::ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_dimensions()?;
    let longest = width.max(height);

    if bytes.len() <= budget && longest <= compressor.config().max_dimension {
        return Ok(FittedReference {
            reference: PreparedReference {
                bytes,
                recompressed: false,
            },
            attempts_used: 0,
            final_quality: 0,
            final_dimension: longest,
            heavily_compressed: false,
        });
    }

    let result = compressor.compress(&bytes, budget)?;
    Ok(FittedReference {
        attempts_used: result.attempts_used,
        final_quality: result.final_quality,
        final_dimension: result.final_dimension,
        heavily_compressed: result.heavily_compressed,
        reference: PreparedReference {
            bytes: result.bytes,
            recompressed: true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_small_reference_passes_through() {
        let compressor = ImageCompressor::new(CompressionConfig::default());
        let bytes = png(32, 32);

        let fitted = fit_reference(&compressor, bytes.clone(), bytes.len()).unwrap();
        assert!(!fitted.reference.recompressed);
        assert_eq!(fitted.reference.bytes, bytes);
    }

    #[test]
    fn test_oversized_dimension_is_recompressed() {
        let compressor = ImageCompressor::new(CompressionConfig {
            max_dimension: 16,
            ..CompressionConfig::default()
        });
        let bytes = png(64, 32);

        let fitted = fit_reference(&compressor, bytes, 1_000_000).unwrap();
        assert!(fitted.reference.recompressed);
        assert_eq!(fitted.final_dimension, 16);
    }

    #[test]
    fn test_classify_rejects_error_status_and_empty_images() {
        let error = GenerationResponse {
            images: vec![],
            status_code: 503,
        };
        assert!(matches!(
            classify(error),
            Err(DispatchError::Provider { status: 503, .. })
        ));
        assert!(matches!(
            classify(GenerationResponse::ok(vec![])),
            Err(DispatchError::EmptyResponse)
        ));

        let image = GeneratedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        };
        assert_eq!(classify(GenerationResponse::ok(vec![image])).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_stored_reference_is_reference_error() {
        let missing = ReferenceImage::Stored {
            path: "/nonexistent/reference.png".into(),
        };
        assert!(matches!(
            load_reference(&missing).await,
            Err(DispatchError::Reference(_))
        ));
    }
}
