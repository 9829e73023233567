//! Internal utilities.

pub mod validation;

pub use validation::{MessageLimits, Validator};
