//! Speech provider service: synthesizes text through a pool of audio
//! pipelines and exposes them on D-Bus as `org.freedesktop.Speech.Provider`.

pub mod backends;
pub mod config_loader;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod service;
pub mod worker;

pub use error::{ProviderError, Result};
