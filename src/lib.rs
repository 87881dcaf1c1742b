/// Times the enclosing scope and opens a debug tracing span for it.
///
/// Only for synchronous code: the span guard must not be held across `.await`.
/// Async stages use [`Profile`] directly.
#[macro_export]
macro_rules! profile {
  ($name:expr) => {
    let _span = tracing::span!(tracing::Level::DEBUG, $name);
    let _enter = _span.enter();
    let _profile = $crate::profiling::Profile::new($name);
  };
}

pub mod budget;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod git;
pub mod ignore;
pub mod pipeline;
pub mod profiling;
pub mod prompt;
pub mod provider;
pub mod sanitize;
pub mod strategy;
pub mod summarize;

// Re-exports
pub use config::Settings;
pub use error::{PipelineError, ProviderError, ProviderErrorKind};
pub use pipeline::{CancelToken, GeneratedMessage, Pipeline};
pub use profiling::Profile;
