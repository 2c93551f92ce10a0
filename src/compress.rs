use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView};

use crate::config::CompressionConfig;
use crate::error::DispatchError;

/// Encodes an image at a given longest-side dimension and quality.
///
/// The compressor drives an encoder through its attempt sequence; swapping
/// the encoder lets tests pin exact output sizes.
pub trait ReferenceEncoder: Send + Sync {
    fn encode(
        &self,
        image: &DynamicImage,
        dimension: u32,
        quality: u8,
    ) -> Result<Vec<u8>, DispatchError>;
}

/// Baseline JPEG encoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegReferenceEncoder;

impl ReferenceEncoder for JpegReferenceEncoder {
    fn encode(
        &self,
        image: &DynamicImage,
        dimension: u32,
        quality: u8,
    ) -> Result<Vec<u8>, DispatchError> {
        let (width, height) = image.dimensions();
        let resized;
        let source = if width.max(height) > dimension {
            resized = image.resize(dimension, dimension, FilterType::Triangle);
            &resized
        } else {
            image
        };

        // JPEG has no alpha channel
        let rgb = source.to_rgb8();
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(buf)
    }
}

/// Outcome of a successful compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionResult {
    pub bytes: Vec<u8>,
    pub final_quality: u8,
    pub final_dimension: u32,
    pub attempts_used: u32,
    /// More attempts than `heavy_compression_threshold` were needed.
    pub heavily_compressed: bool,
}

/// Budget-seeking image shrinker.
///
/// Each attempt encodes once. Quality drops by `quality_step` until the next
/// step would go below `min_quality`; then the dimension is multiplied by
/// `emergency_dimension_factor` and quality starts over from
/// `initial_quality`. The sequence depends only on the input and the
/// config.
pub struct ImageCompressor<E = JpegReferenceEncoder> {
    config: CompressionConfig,
    encoder: E,
}

impl ImageCompressor<JpegReferenceEncoder> {
    pub fn new(config: CompressionConfig) -> Self {
        Self::with_encoder(config, JpegReferenceEncoder)
    }
}

impl<E: ReferenceEncoder> ImageCompressor<E> {
    pub fn with_encoder(config: CompressionConfig, encoder: E) -> Self {
        Self { config, encoder }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Decode `bytes` and compress them to at most `target_bytes`.
    pub fn compress(
        &self,
        bytes: &[u8],
        target_bytes: usize,
    ) -> Result<CompressionResult, DispatchError> {
        let image = image::load_from_memory(bytes)?;
        self.compress_image(&image, target_bytes)
    }

    pub fn compress_image(
        &self,
        image: &DynamicImage,
        target_bytes: usize,
    ) -> Result<CompressionResult, DispatchError> {
        let c = &self.config;
        let (width, height) = image.dimensions();
        let mut dimension = width.max(height).min(c.max_dimension).max(1);
        let mut quality = c.initial_quality;
        let mut smallest = usize::MAX;

        for attempt in 1..=c.max_attempts {
            let encoded = self.encoder.encode(image, dimension, quality)?;
            tracing::trace!(
                attempt,
                dimension,
                quality,
                size = encoded.len(),
                target_bytes,
                "compression attempt"
            );

            if encoded.len() <= target_bytes {
                return Ok(CompressionResult {
                    bytes: encoded,
                    final_quality: quality,
                    final_dimension: dimension,
                    attempts_used: attempt,
                    heavily_compressed: attempt > c.heavy_compression_threshold,
                });
            }
            smallest = smallest.min(encoded.len());

            if quality >= c.min_quality.saturating_add(c.quality_step) {
                quality -= c.quality_step;
            } else {
                let shrunk = (f64::from(dimension) * c.emergency_dimension_factor).floor() as u32;
                dimension = shrunk.max(1);
                quality = c.initial_quality;
            }
        }

        Err(DispatchError::CompressionExhausted {
            target_bytes,
            attempts: c.max_attempts,
            smallest_bytes: smallest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Size is `dimension * quality`; records every call.
    #[derive(Default)]
    struct LinearEncoder {
        calls: Mutex<Vec<(u32, u8)>>,
    }

    impl ReferenceEncoder for LinearEncoder {
        fn encode(
            &self,
            _image: &DynamicImage,
            dimension: u32,
            quality: u8,
        ) -> Result<Vec<u8>, DispatchError> {
            self.calls.lock().unwrap().push((dimension, quality));
            Ok(vec![0u8; dimension as usize * quality as usize])
        }
    }

    fn linear_config() -> CompressionConfig {
        CompressionConfig {
            max_dimension: 800,
            emergency_dimension_factor: 0.5,
            initial_quality: 90,
            min_quality: 60,
            quality_step: 10,
            max_attempts: 12,
            heavy_compression_threshold: 4,
        }
    }

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
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

    #[test]
    fn test_first_attempt_fits() {
        let compressor = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let image = DynamicImage::new_rgb8(1000, 500);

        let result = compressor.compress_image(&image, 72_000).unwrap();
        assert_eq!(result.attempts_used, 1);
        assert_eq!(result.final_dimension, 800);
        assert_eq!(result.final_quality, 90);
        assert!(!result.heavily_compressed);
    }

    #[test]
    fn test_exact_attempt_sequence_with_emergency_shrink() {
        let compressor = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let image = DynamicImage::new_rgb8(1000, 500);

        let result = compressor.compress_image(&image, 24_000).unwrap();
        assert_eq!(result.attempts_used, 8);
        assert_eq!(result.final_dimension, 400);
        assert_eq!(result.final_quality, 60);
        assert_eq!(result.bytes.len(), 24_000);
        assert!(result.heavily_compressed);

        let calls = compressor.encoder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (800, 90),
                (800, 80),
                (800, 70),
                (800, 60),
                (400, 90),
                (400, 80),
                (400, 70),
                (400, 60),
            ]
        );
    }

    #[test]
    fn test_small_image_keeps_native_dimension() {
        let compressor = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let image = DynamicImage::new_rgb8(300, 200);

        let result = compressor.compress_image(&image, 1_000_000).unwrap();
        assert_eq!(result.final_dimension, 300);
    }

    #[test]
    fn test_unreachable_target_exhausts() {
        let compressor = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let image = DynamicImage::new_rgb8(1000, 500);

        let result = compressor.compress_image(&image, 1);
        assert!(matches!(
            result,
            Err(DispatchError::CompressionExhausted {
                target_bytes: 1,
                attempts: 12,
                ..
            })
        ));
        assert_eq!(compressor.encoder.calls.lock().unwrap().len(), 12);
    }

    #[test]
    fn test_same_input_same_sequence() {
        let a = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let b = ImageCompressor::with_encoder(linear_config(), LinearEncoder::default());
        let image = DynamicImage::new_rgb8(640, 480);

        let _ = a.compress_image(&image, 10_000);
        let _ = b.compress_image(&image, 10_000);
        assert_eq!(*a.encoder.calls.lock().unwrap(), *b.encoder.calls.lock().unwrap());
    }

    #[test]
    fn test_jpeg_meets_reachable_target() {
        let config = CompressionConfig {
            max_dimension: 512,
            max_attempts: 30,
            ..CompressionConfig::default()
        };
        let compressor = ImageCompressor::new(config.clone());
        let png = noisy_png(512, 512);
        let target = 20_000;

        let result = compressor.compress(&png, target).unwrap();
        assert!(result.bytes.len() <= target);
        assert!(result.attempts_used <= config.max_attempts);
        assert!(image::load_from_memory(&result.bytes).is_ok());
    }

    #[test]
    fn test_jpeg_one_byte_target_exhausts() {
        let config = CompressionConfig {
            max_attempts: 6,
            ..CompressionConfig::default()
        };
        let compressor = ImageCompressor::new(config);
        let png = noisy_png(64, 64);

        let result = compressor.compress(&png, 1);
        assert!(matches!(
            result,
            Err(DispatchError::CompressionExhausted { attempts: 6, .. })
        ));
    }

    #[test]
    fn test_invalid_bytes_are_image_errors() {
        let compressor = ImageCompressor::new(CompressionConfig::default());
        let result = compressor.compress(b"not an image", 10_000);
        assert!(matches!(result, Err(DispatchError::Image(_))));
    }
}
