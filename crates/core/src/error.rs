use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdpaError {
    /// An operator input violates a rank, dtype, shape or value constraint.
    ///
    /// Raised before any cache mutation, so the caches are untouched.
    #[error("invalid argument `{param}`: {message}")]
    InvalidArgument {
        param: &'static str,
        message: String,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl SdpaError {
    pub(crate) fn invalid(param: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param,
            message: message.into(),
        }
    }

    /// Name of the offending parameter for validation failures.
    pub fn param(&self) -> Option<&'static str> {
        match self {
            Self::InvalidArgument { param, .. } => Some(*param),
            Self::Candle(_) => None,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}
