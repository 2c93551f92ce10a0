//! Per-image byte budget for reference images.
//!
//! ```text
//! usable    = maxPayloadBytes - promptReserve - metadataReserveBytes
//! usable    = usable * (1 - safetyMarginPercent / 100)
//! perImage  = floor(usable / imageCount)
//! perImage  = clamp(perImage, minPerImageBytes, maxPerImageBytes)
//! ```
//!
//! `promptReserve` is `promptReserveBytes`, or the actual prompt size when a
//! prompt is larger than the reserve. A `perImage` below `minPerImageBytes`
//! is an error: clamping up would produce a payload the provider rejects.

use crate::config::PayloadConfig;
use crate::error::ConfigError;

/// Pure calculator over [`PayloadConfig`].
#[derive(Debug, Clone)]
pub struct PayloadBudgeter {
    config: PayloadConfig,
}

impl PayloadBudgeter {
    pub fn new(config: PayloadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Bytes left for images after reserves and the safety margin.
    pub fn usable_bytes(&self, prompt_bytes: usize) -> usize {
        let c = &self.config;
        let prompt_reserve = c.prompt_reserve_bytes.max(prompt_bytes);
        let usable = c
            .max_payload_bytes
            .saturating_sub(prompt_reserve)
            .saturating_sub(c.metadata_reserve_bytes);
        (usable as f64 * (100.0 - c.safety_margin_percent) / 100.0).floor() as usize
    }

    /// Budget for each of `image_count` references of one request.
    ///
    /// Returns `Ok(None)` when there are no images (nothing to compress).
    pub fn per_image_budget(
        &self,
        image_count: usize,
        prompt_bytes: usize,
    ) -> Result<Option<usize>, ConfigError> {
        if image_count == 0 {
            return Ok(None);
        }

        let per_image = self.usable_bytes(prompt_bytes) / image_count;
        if per_image < self.config.min_per_image_bytes {
            return Err(ConfigError::BudgetUnsatisfiable {
                per_image,
                min_per_image: self.config.min_per_image_bytes,
                image_count,
            });
        }
        Ok(Some(per_image.min(self.config.max_per_image_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PayloadConfig {
        PayloadConfig {
            max_payload_bytes: 1_000_000,
            max_reference_images: 16,
            prompt_reserve_bytes: 100_000,
            metadata_reserve_bytes: 50_000,
            safety_margin_percent: 10.0,
            min_per_image_bytes: 10_000,
            max_per_image_bytes: 1_000_000,
        }
    }

    #[test]
    fn test_zero_images_needs_no_budget() {
        let budgeter = PayloadBudgeter::new(config());
        assert_eq!(budgeter.per_image_budget(0, 0).unwrap(), None);
    }

    #[test]
    fn test_single_image_gets_whole_usable_space() {
        let budgeter = PayloadBudgeter::new(config());
        // (1_000_000 - 100_000 - 50_000) * 0.9
        assert_eq!(budgeter.usable_bytes(0), 765_000);
        assert_eq!(budgeter.per_image_budget(1, 0).unwrap(), Some(765_000));
    }

    #[test]
    fn test_division_floors() {
        let budgeter = PayloadBudgeter::new(config());
        assert_eq!(budgeter.per_image_budget(3, 0).unwrap(), Some(255_000));
        assert_eq!(budgeter.per_image_budget(7, 0).unwrap(), Some(109_285));
    }

    #[test]
    fn test_clamped_to_max_per_image() {
        let budgeter = PayloadBudgeter::new(PayloadConfig {
            max_per_image_bytes: 200_000,
            ..config()
        });
        assert_eq!(budgeter.per_image_budget(1, 0).unwrap(), Some(200_000));
        assert_eq!(budgeter.per_image_budget(4, 0).unwrap(), Some(191_250));
    }

    #[test]
    fn test_always_within_bounds() {
        for max_per_image in [20_000, 150_000, 1_000_000] {
            let budgeter = PayloadBudgeter::new(PayloadConfig {
                max_per_image_bytes: max_per_image,
                ..config()
            });
            for count in 1..=16 {
                let budget = budgeter.per_image_budget(count, 0).unwrap().unwrap();
                assert!(budget >= 10_000, "count {} budget {}", count, budget);
                assert!(budget <= max_per_image, "count {} budget {}", count, budget);
            }
        }
    }

    #[test]
    fn test_monotonic_in_image_count() {
        let budgeter = PayloadBudgeter::new(config());
        let budgets: Vec<usize> = (1..=16)
            .map(|n| budgeter.per_image_budget(n, 0).unwrap().unwrap())
            .collect();
        for pair in budgets.windows(2) {
            assert!(pair[1] < pair[0], "{:?}", budgets);
        }
    }

    #[test]
    fn test_unsatisfiable_is_reported() {
        let budgeter = PayloadBudgeter::new(PayloadConfig {
            max_payload_bytes: 200_000,
            ..config()
        });
        // usable = 50_000 * 0.9 = 45_000; 5 images -> 9_000 < 10_000
        let result = budgeter.per_image_budget(5, 0);
        assert!(matches!(
            result,
            Err(ConfigError::BudgetUnsatisfiable {
                per_image: 9_000,
                min_per_image: 10_000,
                image_count: 5,
            })
        ));
        assert_eq!(budgeter.per_image_budget(4, 0).unwrap(), Some(11_250));
    }

    #[test]
    fn test_reserves_exceeding_payload_are_unsatisfiable() {
        let budgeter = PayloadBudgeter::new(PayloadConfig {
            max_payload_bytes: 120_000,
            ..config()
        });
        assert!(budgeter.per_image_budget(1, 0).is_err());
    }

    #[test]
    fn test_large_prompt_replaces_reserve() {
        let budgeter = PayloadBudgeter::new(config());
        // Prompt below reserve changes nothing
        assert_eq!(budgeter.usable_bytes(5_000), 765_000);
        // (1_000_000 - 300_000 - 50_000) * 0.9
        assert_eq!(budgeter.usable_bytes(300_000), 585_000);
    }

    #[test]
    fn test_deterministic() {
        let budgeter = PayloadBudgeter::new(config());
        let a: Vec<_> = (1..10).map(|n| budgeter.per_image_budget(n, 0).ok()).collect();
        let b: Vec<_> = (1..10).map(|n| budgeter.per_image_budget(n, 0).ok()).collect();
        assert_eq!(a, b);
    }
}
