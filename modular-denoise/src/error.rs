//! Error type shared by every module of the denoise pipeline.
//!
//! All errors are fail-fast: a module that returns an error aborts the whole generation and the
//! error propagates to the host unchanged.

/// Errors raised while resolving or evaluating a module tree.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The module tree or one of its parameters cannot be used as given.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tensor does not have the rank or shape an operation requires.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// A tensor holds NaN or infinite values.
    #[error("non-finite values in {name}: {summary}")]
    NonFinite { name: String, summary: String },

    /// A required generation input was not supplied.
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Return early with a [`Error::Configuration`].
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Configuration(format!($($arg)*)))
    };
}
