//! YAML engine configuration with environment substitution.

pub mod env;
pub mod schema;

pub use schema::{
    BrowserConfig, CircuitConfig, EngineConfig, LoopConfig, PlannerConfig, RetryConfig,
    TypingConfig, UploadConfig, Viewport, MAX_UPLOAD_IMAGES,
};
