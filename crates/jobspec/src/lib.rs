//! `beacon-jobspec` - the signed job specification and everything needed to
//! accept one.
//!
//! ## Components
//!
//! - `model`: the JobSpec wire model
//! - `validation`: required-field checks and effective constraint defaults
//! - `canonical`: deterministic canonical JSON (tagged-union tree + recursive prune)
//! - `signature`: ed25519 verification (and signing, for tooling/tests)

pub mod canonical;
pub mod model;
pub mod signature;
pub mod validation;

pub use canonical::{CanonicalValue, canonicalize_job_spec, canonicalize_value};
pub use model::{
    Benchmark, Container, ExecutionConstraints, InputSpec, JobSpec, ModelSpec, ResourceSpec,
    ScoringSpec, WalletAuth,
};
pub use signature::{SignatureError, sign_job_spec, verify, verify_job_spec};
pub use validation::{EffectiveConstraints, ValidationError, validate};
