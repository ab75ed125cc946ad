//! Error type shared by the decoder, the file scanner and the locator.

use thiserror::Error;

/// All errors produced by lma-locate.
#[derive(Debug, Error)]
pub enum LmaError {
    /// Bit-pattern mismatch, truncated record or a frame that does not line
    /// up with its boundaries. Aborts the current decode or frame read.
    #[error("format error: {0}")]
    Format(String),
    #[error("unsupported raw data version {0}")]
    UnsupportedVersion(u8),
    #[error("frame {index} out of range (file has {count} frames)")]
    FrameOutOfRange { index: usize, count: usize },
    #[error("geodesic distance could not be evaluated")]
    GeodesicOutOfRange,
    #[error("solver failure: {0}")]
    Solver(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LmaError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        LmaError::Format(msg.into())
    }

    /// True for errors that only invalidate the current file or frame.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            LmaError::Format(_) | LmaError::UnsupportedVersion(_) | LmaError::FrameOutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_errors_are_skippable() {
        assert!(LmaError::format("truncated status record").is_format());
        assert!(LmaError::UnsupportedVersion(14).is_format());
        assert!(LmaError::FrameOutOfRange { index: 5, count: 5 }.is_format());

        assert!(!LmaError::Solver("non-finite residual".into()).is_format());
        assert!(!LmaError::GeodesicOutOfRange.is_format());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!LmaError::from(io).is_format());
    }
}
