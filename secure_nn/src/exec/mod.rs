mod context;
mod secret;

pub use context::ExecutionContext;
pub use secret::{SecretLayer, SecretPipeline};
