use crate::photos::PhotoRole;

/// Failures a single user action can hit. All of these are recoverable at the
/// session level; retry is always a manual action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SceneError {
    #[error("no {role} photo available; at least one is required before generating")]
    PreconditionFailed { role: PhotoRole },
    #[error("prior image carries no usable payload; generate a variation instead of editing")]
    InvalidImageData,
    #[error("prior image payload is not valid base64 data; generate a variation instead of editing")]
    CorruptedImageData,
    #[error("backend response carried neither an image nor text")]
    NoContentInResponse,
    #[error("{0}")]
    Unknown(String),
}

impl SceneError {
    pub fn code(&self) -> &'static str {
        match self {
            SceneError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            SceneError::InvalidImageData => "INVALID_IMAGE_DATA",
            SceneError::CorruptedImageData => "CORRUPTED_IMAGE_DATA",
            SceneError::NoContentInResponse => "NO_CONTENT_IN_RESPONSE",
            SceneError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Recovers the stable error code from an `anyhow` chain, falling back to
/// `UNKNOWN_ERROR` for transport and decode failures wrapped at the call
/// boundary.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<SceneError>()
        .map(SceneError::code)
        .unwrap_or("UNKNOWN_ERROR")
}

#[cfg(test)]
mod tests {
    use super::{error_code, SceneError};
    use crate::photos::PhotoRole;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            SceneError::PreconditionFailed {
                role: PhotoRole::Current
            }
            .code(),
            "PRECONDITION_FAILED"
        );
        assert_eq!(SceneError::InvalidImageData.code(), "INVALID_IMAGE_DATA");
        assert_eq!(
            SceneError::CorruptedImageData.code(),
            "CORRUPTED_IMAGE_DATA"
        );
        assert_eq!(
            SceneError::NoContentInResponse.code(),
            "NO_CONTENT_IN_RESPONSE"
        );
        assert_eq!(SceneError::Unknown("boom".to_string()).code(), "UNKNOWN_ERROR");
    }

    #[test]
    fn precondition_names_the_missing_role() {
        let err = SceneError::PreconditionFailed {
            role: PhotoRole::Historical,
        };
        assert!(err.to_string().contains("historical"));
    }

    #[test]
    fn error_code_survives_anyhow_wrapping() {
        let wrapped = anyhow::Error::new(SceneError::NoContentInResponse).context("generation failed");
        assert_eq!(error_code(&wrapped), "NO_CONTENT_IN_RESPONSE");

        let transport = anyhow::anyhow!("connection reset");
        assert_eq!(error_code(&transport), "UNKNOWN_ERROR");
    }
}
