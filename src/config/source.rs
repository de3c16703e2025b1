//! Simulated sampling sources.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::entity::{SamplingError, SamplingFn};

fn default_step() -> f64 {
    1.0
}

/// Value source of a configured metric.
///
/// ```yaml
/// source: { type: constant, value: 21.5 }
/// source: { type: random, min: 18.0, max: 24.0 }
/// source: { type: counter, start: 0, step: 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Always the same value.
    Constant { value: f64 },
    /// Uniformly distributed in `[min, max)`.
    Random { min: f64, max: f64 },
    /// `start`, `start + step`, `start + 2 * step`, ...
    Counter {
        #[serde(default)]
        start: f64,
        #[serde(default = "default_step")]
        step: f64,
    },
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), String> {
        let finite = match self {
            Self::Constant { value } => value.is_finite(),
            Self::Random { min, max } => min.is_finite() && max.is_finite(),
            Self::Counter { start, step } => start.is_finite() && step.is_finite(),
        };
        if !finite {
            return Err("source values must be finite".to_string());
        }
        if let Self::Random { min, max } = self
            && min >= max
        {
            return Err(format!("random source needs min < max (got {min} >= {max})"));
        }
        Ok(())
    }

    /// Build the sampling function producing this source's values.
    pub fn sampling_fn(&self) -> SamplingFn {
        match *self {
            Self::Constant { value } => SamplingFn::infallible(move || value),
            Self::Random { min, max } => SamplingFn::new(move || {
                if min < max {
                    Ok(rand::thread_rng().gen_range(min..max))
                } else {
                    Err(SamplingError::new(format!("empty range {min}..{max}")))
                }
            }),
            Self::Counter { start, step } => {
                let ticks = Arc::new(AtomicU64::new(0));
                SamplingFn::infallible(move || {
                    start + step * ticks.fetch_add(1, Ordering::Relaxed) as f64
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_sources() {
        let constant: SourceConfig = serde_yaml::from_str("{ type: constant, value: 21.5 }").unwrap();
        assert_eq!(constant, SourceConfig::Constant { value: 21.5 });

        let counter: SourceConfig = serde_yaml::from_str("type: counter").unwrap();
        assert_eq!(
            counter,
            SourceConfig::Counter {
                start: 0.0,
                step: 1.0
            }
        );

        assert!(serde_yaml::from_str::<SourceConfig>("type: sine").is_err());
    }

    #[test]
    fn test_constant_and_counter() {
        let constant = SourceConfig::Constant { value: 3.0 }.sampling_fn();
        assert_eq!(constant.sample(), Ok(3.0));
        assert_eq!(constant.sample(), Ok(3.0));

        let counter = SourceConfig::Counter {
            start: 10.0,
            step: 2.5,
        }
        .sampling_fn();
        assert_eq!(counter.sample(), Ok(10.0));
        assert_eq!(counter.sample(), Ok(12.5));
        assert_eq!(counter.sample(), Ok(15.0));
    }

    #[test]
    fn test_random_in_range() {
        let random = SourceConfig::Random {
            min: 18.0,
            max: 24.0,
        }
        .sampling_fn();
        for _ in 0..100 {
            let value = random.sample().unwrap();
            assert!((18.0..24.0).contains(&value));
        }
    }

    #[test]
    fn test_validate() {
        assert!(SourceConfig::Random { min: 1.0, max: 2.0 }.validate().is_ok());
        assert!(SourceConfig::Random { min: 2.0, max: 2.0 }.validate().is_err());
        assert!(
            SourceConfig::Constant { value: f64::NAN }
                .validate()
                .is_err()
        );

        // An invalid range reports a sampling error instead of panicking.
        let broken = SourceConfig::Random { min: 5.0, max: 1.0 }.sampling_fn();
        assert!(broken.sample().is_err());
    }
}
