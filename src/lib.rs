// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub mod telemetry;

// Domain layer (business logic)
pub mod backpressure;
pub mod dispatcher;
pub mod queue;
