use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_gen_dispatch::*;

/// Echoes how many reference bytes it received.
struct InspectingProvider;

impl Transport for InspectingProvider {
    async fn send(&self, job: &GenerationJob) -> Result<GenerationResponse, TransportError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for (i, reference) in job.references.iter().enumerate() {
            println!(
                "  job {} ref {}: {} bytes (recompressed: {})",
                &job.job_id[..8],
                i,
                reference.bytes.len(),
                reference.recompressed
            );
        }
        Ok(GenerationResponse::ok(vec![GeneratedImage {
            bytes: Vec::new(),
            mime_type: "image/png".to_string(),
        }]))
    }
}

fn gradient_png(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width) as u8,
            (y * 255 / height) as u8,
            ((x ^ y) % 256) as u8,
        ])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging("image_gen_dispatch=debug");

    // A tight payload so the large reference has to be shrunk.
    let config = DispatchConfig::builder()
        .with_payload(PayloadConfig {
            max_payload_bytes: 600_000,
            max_reference_images: 4,
            prompt_reserve_bytes: 4_096,
            metadata_reserve_bytes: 4_096,
            safety_margin_percent: 10.0,
            min_per_image_bytes: 20_000,
            max_per_image_bytes: 250_000,
        })
        .with_compression(CompressionConfig {
            max_dimension: 1024,
            heavy_compression_threshold: 2,
            ..CompressionConfig::default()
        })
        .build()?;

    let stored_path = std::env::temp_dir().join("image-gen-dispatch-demo-ref.png");
    tokio::fs::write(&stored_path, gradient_png(2400, 1600)?).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let dispatcher = Dispatcher::builder(config, Arc::new(InspectingProvider))
        .with_events(tx)
        .build()?;

    let entry = QueueEntry::new(
        PromptSource::Inline("the same scene, in watercolor".into()),
        "image-model-v2",
    )
    .fixed(2)
    .with_reference(ReferenceImage::Stored {
        path: stored_path.clone(),
    })
    .with_reference(ReferenceImage::Inline {
        bytes: gradient_png(64, 64)?,
    })
    .with_ext_param("styleStrength", serde_json::json!(0.7));

    let summary = dispatcher.run(vec![entry]).await?;

    while let Ok(event) = rx.try_recv() {
        if let DispatchEvent::HeavyCompression(e) = event {
            println!(
                "heavy compression on batch {}: {} attempts, quality {}, {} px",
                e.batch, e.attempts_used, e.final_quality, e.final_dimension
            );
        }
    }

    println!(
        "Produced {} image(s), {} failed",
        summary.produced, summary.failed
    );
    tokio::fs::remove_file(&stored_path).await?;
    Ok(())
}
