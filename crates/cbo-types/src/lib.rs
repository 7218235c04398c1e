//! # cbo-types
//!
//! Core value types shared by the constrained Bayesian optimizer: parameter
//! bounds, assignments, observations, lifecycle events and the error
//! taxonomy.

pub mod errors;
pub mod events;
pub mod space;

pub use errors::*;
pub use events::*;
pub use space::*;
