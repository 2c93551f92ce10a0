use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image_gen_dispatch::*;

/// Pretend provider: every fifth call is rate limited, the rest succeed.
struct SimulatedProvider {
    calls: AtomicUsize,
}

impl Transport for SimulatedProvider {
    async fn send(&self, job: &GenerationJob) -> Result<GenerationResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;

        if call % 5 == 4 {
            return Err(TransportError::Status {
                status: 429,
                body: "slow down".to_string(),
            });
        }

        let images = (0..job.image_count)
            .map(|i| GeneratedImage {
                bytes: format!("{}:{}:{}", job.entry_id, job.batch_index, i).into_bytes(),
                mime_type: "image/png".to_string(),
            })
            .collect();
        Ok(GenerationResponse::ok(images))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging("image_gen_dispatch=info");

    let config = DispatchConfig::builder()
        .with_rate_limit(20, Duration::from_secs(10), Duration::from_millis(100))
        .with_max_concurrent(3)
        .with_retry_policy(RetryPolicyConfig {
            max_retries: 3,
            backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        })
        .build()?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let dispatcher = Dispatcher::builder(
        config,
        Arc::new(SimulatedProvider {
            calls: AtomicUsize::new(0),
        }),
    )
    .with_events(tx)
    .with_prompt("lighthouse", "a lighthouse in a storm, oil painting")
    .build()?;

    let mut landscapes = QueueGroup::new("Landscapes");
    landscapes.push(
        QueueEntry::new(PromptSource::Library("lighthouse".into()), "image-model-v2")
            .with_id("lighthouse")
            .fixed(3)
            .with_images_per_batch(2),
    );
    landscapes.push(
        QueueEntry::new(
            PromptSource::Alternatives(vec![
                "misty pine forest at dawn".into(),
                "desert canyon at noon".into(),
            ]),
            "image-model-v2",
        )
        .with_id("alternating")
        .target(8)
        .with_images_per_batch(2)
        .with_resolution(Resolution::AspectRatio {
            width: 16,
            height: 9,
        }),
    );

    let mut drafts = QueueGroup::new("Drafts");
    drafts.collapsed = true;
    drafts.push(
        QueueEntry::new(PromptSource::Inline("a red bicycle".into()), "image-model-v2")
            .with_id("disabled-draft")
            .with_enabled(false),
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DispatchEvent::EntryProgress(p) => println!(
                    "[progress] {:<14} {:<9} produced={} failed={}",
                    p.entry_id,
                    p.state.as_str(),
                    p.produced_count,
                    p.failed_count
                ),
                DispatchEvent::ImagesProduced(p) => println!(
                    "[images]   {:<14} batch {} -> {} image(s)",
                    p.entry_id,
                    p.batch,
                    p.images.len()
                ),
                DispatchEvent::HeavyCompression(_) => {}
                DispatchEvent::RunFinished(_) => break,
            }
        }
    });

    let summary = dispatcher.run_groups(&[landscapes, drafts]).await?;
    printer.await?;

    println!();
    println!(
        "Done in {} ms: {} produced, {} failed",
        summary.duration_ms, summary.produced, summary.failed
    );
    for entry in &summary.entries {
        println!("  {} -> {}", entry.entry_id, entry.state.as_str());
    }
    Ok(())
}
