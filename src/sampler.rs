use crate::features::{NUM_SEMITONE_CLASSES, SemitoneVector};
use log::warn;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

/// Draws semitone classes from a temperature-scaled categorical distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSampler {
    temperature: f64,
}

impl TemperatureSampler {
    /// `temperature` must be positive and finite; `GenerationConfig` validates this.
    pub fn new(temperature: f64) -> Self {
        debug_assert!(temperature.is_finite() && temperature > 0.0);
        Self { temperature }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Rescales `probs` as `exp(ln(p) / t)` and renormalizes.
    ///
    /// The largest log is subtracted before exponentiating, so low temperatures
    /// sharpen toward the mode instead of underflowing. Zero entries stay zero.
    /// Returns `None` for distributions with nothing positive or with NaNs.
    pub fn scale(&self, probs: &[f32]) -> Option<Vec<f64>> {
        let logits: Vec<f64> = probs
            .iter()
            .map(|&p| (p as f64).ln() / self.temperature)
            .collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return None;
        }

        let scaled: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
        let total: f64 = scaled.iter().sum();

        if !total.is_finite() || total <= 0.0 {
            return None;
        }
        Some(scaled.into_iter().map(|s| s / total).collect())
    }

    /// Draws one class index.
    ///
    /// A distribution that collapses after scaling still yields a valid class:
    /// the most likely class of the unscaled distribution.
    pub fn sample<R: Rng + ?Sized>(&self, probs: &[f32], rng: &mut R) -> usize {
        let drawn = self
            .scale(probs)
            .and_then(|weights| WeightedIndex::new(&weights).ok())
            .map(|dist| dist.sample(rng));

        match drawn {
            Some(class) => class,
            None => {
                let class = argmax(probs);
                warn!(
                    "Degenerate sampling distribution at temperature {}, falling back to class {}..!",
                    self.temperature, class
                );
                class
            }
        }
    }

    /// Draws a class and returns it alongside its one-hot vector.
    pub fn sample_one_hot<R: Rng + ?Sized>(
        &self,
        probs: &SemitoneVector,
        rng: &mut R,
    ) -> (usize, SemitoneVector) {
        let class = self.sample(probs, rng);
        let mut one_hot = [0.0f32; NUM_SEMITONE_CLASSES];
        one_hot[class] = 1.0;
        (class, one_hot)
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value { (i, v) } else { (best, best_value) }
        })
        .0
}
