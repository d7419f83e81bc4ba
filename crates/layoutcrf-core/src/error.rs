use thiserror::Error;

/// Errors that can occur while building, training or serving layout models.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// A configuration value is unknown or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A configuration profile could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A record does not match the schema of its model.
    #[error("malformed record: {0}")]
    Data(String),

    /// A record line is not valid JSON.
    #[error("failed to decode record: {0}")]
    Json(#[from] serde_json::Error),

    /// A keyword pattern failed to compile.
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),

    /// The vocabulary file is missing or empty.
    #[error("vocabulary error: {0}")]
    Vocab(String),

    /// No checkpoint or export could be found or loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// An exported bundle could not be written or read.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// A served image could not be decoded.
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    /// A prediction request does not match the serving signature.
    #[error("invalid request: {0}")]
    Request(String),

    /// Candle ML framework error.
    #[error("ML framework error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for layout model operations.
pub type Result<T> = std::result::Result<T, LayoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = LayoutError::Config("unknown model type foo".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: unknown model type foo"
        );

        let err = LayoutError::ModelLoad("no checkpoint in logs/line-crf".into());
        assert!(err.to_string().contains("logs/line-crf"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LayoutError>();
    }

    #[test]
    fn candle_errors_convert() {
        let err: LayoutError = candle_core::Error::Msg("shape".into()).into();
        assert!(matches!(err, LayoutError::Candle(_)));
    }
}
