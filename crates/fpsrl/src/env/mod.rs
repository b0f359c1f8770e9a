//! Single-environment contract.
//!
//! Provides the `Environment` trait that pixel-observation games implement so
//! they can be driven by any asynchronous pool in [`crate::vector`].

mod traits;

pub use traits::{EnvInfo, Environment, StepResult, KILLCOUNT_TOTAL};
