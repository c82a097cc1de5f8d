//! Crate-level error types for `hotswap-kernel`.
//!
//! [`HotSwapError`] composes the typed errors of every sub-module and is
//! carried inside [`error_stack::Report`] at the outer surfaces (agent
//! installation, configuration loading) so context can be attached as
//! the error propagates.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use hotswap_kernel::error::{HotSwapResult, IntoHotSwapReport};
//!
//! fn load() -> HotSwapResult<HotSwapConfig> {
//!     HotSwapConfig::load("hotswap.toml")
//!         .into_report()
//!         .attach("loading hotswap.toml")
//! }
//! ```

use error_stack::Report;
use thiserror::Error;

use crate::config::ConfigError;
use crate::container::ContainerError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HotSwapError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised by runtime components (scheduler, watcher, coordinator).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Equivalent to `Result<T, error_stack::Report<HotSwapError>>`.
pub type HotSwapResult<T> = Result<T, Report<HotSwapError>>;

/// Extension trait to lift any error convertible into [`HotSwapError`]
/// into a [`HotSwapResult`].
pub trait IntoHotSwapReport<T> {
    fn into_report(self) -> HotSwapResult<T>;
}

impl<T, E> IntoHotSwapReport<T> for Result<T, E>
where
    E: Into<HotSwapError>,
{
    #[inline]
    fn into_report(self) -> HotSwapResult<T> {
        self.map_err(|e| Report::new(e.into()))
    }
}
