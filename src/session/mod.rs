//! Session registry and lifecycle

pub mod registry;

pub use registry::{EndOutcome, SessionRegistry};
