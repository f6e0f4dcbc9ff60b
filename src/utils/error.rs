use thiserror::Error;

#[derive(Error, Debug)]
pub enum RozError {
    #[error("S3 request failed ({code}): {message}")]
    S3Error { code: String, message: String },

    #[error("Message bus error: {0}")]
    BusError(#[from] lapin::Error),

    #[error("Message bus error: {message}")]
    BusProtocolError { message: String },

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("ETag mismatch for {uri}: expected {expected}, found {found}")]
    EtagMismatch {
        uri: String,
        expected: String,
        found: String,
    },

    #[error("Pipeline error: {message}")]
    PipelineError { message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// 可以忽略，服務繼續運行
    Low,
    /// 外部服務暫時失敗
    Medium,
    /// 配置檔案內容錯誤
    High,
    /// 缺少必要配置，服務無法啟動
    Critical,
}

impl RozError {
    pub fn s3(code: impl Into<String>, message: impl Into<String>) -> Self {
        RozError::S3Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RozError::ConfigError {
            message: message.into(),
        }
    }

    pub fn invalid_value(field: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        RozError::InvalidConfigValueError {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        RozError::ProcessingError {
            message: message.into(),
        }
    }

    /// S3 service error code, if this error came from S3.
    pub fn s3_code(&self) -> Option<&str> {
        match self {
            RozError::S3Error { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_s3_code(&self, expected: &str) -> bool {
        self.s3_code() == Some(expected)
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RozError::MissingConfigError { .. } => ErrorSeverity::Critical,
            RozError::ConfigError { .. }
            | RozError::InvalidConfigValueError { .. }
            | RozError::TomlError(_) => ErrorSeverity::High,
            RozError::S3Error { .. }
            | RozError::BusError(_)
            | RozError::BusProtocolError { .. }
            | RozError::ApiError(_)
            | RozError::IoError(_)
            | RozError::PipelineError { .. } => ErrorSeverity::Medium,
            RozError::CsvError(_)
            | RozError::SerializationError(_)
            | RozError::EtagMismatch { .. }
            | RozError::ProcessingError { .. } => ErrorSeverity::Low,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            RozError::MissingConfigError { .. } => "設定缺少必要欄位，請檢查環境變數或設定檔",
            RozError::ConfigError { .. }
            | RozError::InvalidConfigValueError { .. }
            | RozError::TomlError(_) => "請檢查設定檔格式與內容",
            RozError::S3Error { .. } => "Check the S3 endpoint, credentials and bucket policies",
            RozError::BusError(_) | RozError::BusProtocolError { .. } => {
                "Check that RabbitMQ is reachable with the varys profile credentials"
            }
            RozError::ApiError(_) => "Check network connectivity and the remote service status",
            RozError::PipelineError { .. } => "Check the Nextflow executable and pipeline configuration",
            _ => "See the log for details",
        }
    }

    /// Process exit code for a service that stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Critical => 3,
            ErrorSeverity::High => 2,
            ErrorSeverity::Medium | ErrorSeverity::Low => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RozError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_code_lookup() {
        let err = RozError::s3("NoSuchBucket", "bucket is gone");
        assert_eq!(err.s3_code(), Some("NoSuchBucket"));
        assert!(err.is_s3_code("NoSuchBucket"));
        assert!(!RozError::config("bad").is_s3_code("NoSuchBucket"));
    }

    #[test]
    fn test_exit_codes_follow_severity() {
        let missing = RozError::MissingConfigError {
            field: "ROZ_CONFIG_JSON".to_string(),
        };
        assert_eq!(missing.exit_code(), 3);
        assert_eq!(RozError::config("invalid layout").exit_code(), 2);
        assert_eq!(RozError::s3("AccessDenied", "denied").exit_code(), 1);
    }
}
