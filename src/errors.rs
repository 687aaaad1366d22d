// Error taxonomy for the intent engine.
//
// Every failure a caller can meaningfully react to gets its own variant;
// load and transport errors keep their cause chain intact so the engine
// boundary can log full detail before degrading to an apology.

use thiserror::Error;

/// Failures raised by a `BundleStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact '{0}' not found")]
    NotFound(String),
    #[error("storage i/o failure for '{name}'")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised by training, bundle codec, and inference.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("training corpus is empty or degenerate: {0}")]
    Corpus(String),
    #[error("model bundle artifact '{0}' is missing")]
    BundleMissing(String),
    #[error("weight blob holds {actual} floats but the manifest requires {expected}")]
    InsufficientWeightData { expected: usize, actual: usize },
    #[error("no model has been loaded")]
    ModelNotLoaded,
    #[error("storage transport failure for '{name}'")]
    Transport {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model bundle: {0}")]
    InvalidBundle(String),
    #[error("model computation failed")]
    Model(#[from] candle_core::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => EngineError::BundleMissing(name),
            StoreError::Io { name, source } => EngineError::Transport { name, source },
        }
    }
}
