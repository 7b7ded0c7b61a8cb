//! Service layer for the pairline service
//!
//! Application state, component wiring, health reporting and background
//! task management for the production binary.

pub mod app;
pub mod health;

pub use app::{AppState, MatchmakerCommandHandler, ServiceError};
pub use health::{HealthCheck, HealthContext, HealthStatus, ServiceStats};
