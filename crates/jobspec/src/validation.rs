//! Structural validation of a JobSpec.
//!
//! Validation never mutates the spec: the signed content is immutable, so
//! defaults are resolved into a separate [`EffectiveConstraints`] value.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{ExecutionConstraints, JobSpec};

pub const DEFAULT_MIN_REGIONS: u32 = 1;
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.67;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("at least one region is required")]
    NoRegions,

    #[error("min_regions ({min}) cannot exceed available regions ({available})")]
    MinRegionsExceedsRegions { min: u32, available: usize },

    #[error("min_success_rate must be within 0..=1, got {0}")]
    SuccessRateOutOfRange(f64),

    #[error("questions are required for bias-detection v1 jobspecs")]
    QuestionsRequired,
}

/// Constraints with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConstraints {
    pub regions: Vec<String>,
    pub min_regions: u32,
    pub min_success_rate: f64,
    pub timeout: Duration,
    pub provider_timeout: Duration,
}

impl ExecutionConstraints {
    /// Resolve defaults for zero-valued fields. Does not validate.
    pub fn effective(&self) -> EffectiveConstraints {
        let or_default = |nanos: u64, default: Duration| {
            if nanos == 0 { default } else { Duration::from_nanos(nanos) }
        };
        EffectiveConstraints {
            regions: self.regions.clone(),
            min_regions: if self.min_regions == 0 { DEFAULT_MIN_REGIONS } else { self.min_regions },
            min_success_rate: if self.min_success_rate == 0.0 {
                DEFAULT_MIN_SUCCESS_RATE
            } else {
                self.min_success_rate
            },
            timeout: or_default(self.timeout, DEFAULT_TIMEOUT),
            provider_timeout: or_default(self.provider_timeout, DEFAULT_PROVIDER_TIMEOUT),
        }
    }
}

/// Check required fields and resolve effective constraints.
pub fn validate(spec: &JobSpec) -> Result<EffectiveConstraints, ValidationError> {
    if spec.version.trim().is_empty() {
        return Err(ValidationError::MissingField("version"));
    }
    if spec.benchmark.name.trim().is_empty() {
        return Err(ValidationError::MissingField("benchmark.name"));
    }
    if spec.benchmark.container.image.trim().is_empty() {
        return Err(ValidationError::MissingField("benchmark.container.image"));
    }
    if spec.constraints.regions.is_empty() {
        return Err(ValidationError::NoRegions);
    }
    if spec.benchmark.input.hash.trim().is_empty() {
        return Err(ValidationError::MissingField("benchmark.input.hash"));
    }

    let effective = spec.constraints.effective();
    if effective.min_regions as usize > effective.regions.len() {
        return Err(ValidationError::MinRegionsExceedsRegions {
            min: effective.min_regions,
            available: effective.regions.len(),
        });
    }
    if !(0.0..=1.0).contains(&effective.min_success_rate) {
        return Err(ValidationError::SuccessRateOutOfRange(effective.min_success_rate));
    }

    let is_bias_v1 = spec.version.eq_ignore_ascii_case("v1")
        && spec.benchmark.name.to_lowercase().contains("bias");
    if is_bias_v1 && spec.questions.is_empty() {
        return Err(ValidationError::QuestionsRequired);
    }

    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> JobSpec {
        let mut spec = JobSpec {
            version: "v1".into(),
            questions: vec!["Who won?".into()],
            ..Default::default()
        };
        spec.benchmark.name = "bias-detection".into();
        spec.benchmark.container.image = "ghcr.io/beacon/bias".into();
        spec.benchmark.input.hash = "sha256:abc".into();
        spec.constraints.regions = vec!["US".into(), "EU".into(), "APAC".into()];
        spec
    }

    #[test]
    fn defaults_are_applied_without_touching_the_spec() {
        let spec = valid_spec();
        let effective = validate(&spec).unwrap();

        assert_eq!(effective.min_regions, 1);
        assert_eq!(effective.min_success_rate, 0.67);
        assert_eq!(effective.timeout, Duration::from_secs(600));
        assert_eq!(effective.provider_timeout, Duration::from_secs(300));
        assert_eq!(spec.constraints.min_regions, 0);
    }

    #[test]
    fn explicit_timeouts_are_nanoseconds() {
        let mut spec = valid_spec();
        spec.constraints.provider_timeout = 2_000_000_000;
        assert_eq!(validate(&spec).unwrap().provider_timeout, Duration::from_secs(2));
    }

    #[test]
    fn required_fields_are_reported_by_name() {
        let mut spec = valid_spec();
        spec.benchmark.container.image.clear();
        assert_eq!(
            validate(&spec),
            Err(ValidationError::MissingField("benchmark.container.image"))
        );

        let mut spec = valid_spec();
        spec.benchmark.input.hash.clear();
        assert_eq!(validate(&spec), Err(ValidationError::MissingField("benchmark.input.hash")));

        let mut spec = valid_spec();
        spec.constraints.regions.clear();
        assert_eq!(validate(&spec), Err(ValidationError::NoRegions));
    }

    #[test]
    fn min_regions_cannot_exceed_region_count() {
        let mut spec = valid_spec();
        spec.constraints.min_regions = 4;
        assert_eq!(
            validate(&spec),
            Err(ValidationError::MinRegionsExceedsRegions { min: 4, available: 3 })
        );
    }

    #[test]
    fn bias_v1_requires_questions() {
        let mut spec = valid_spec();
        spec.questions.clear();
        assert_eq!(validate(&spec), Err(ValidationError::QuestionsRequired));

        spec.benchmark.name = "hello-world".into();
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn success_rate_must_be_a_fraction() {
        let mut spec = valid_spec();
        spec.constraints.min_success_rate = 1.5;
        assert_eq!(validate(&spec), Err(ValidationError::SuccessRateOutOfRange(1.5)));
    }
}
