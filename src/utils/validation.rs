use crate::utils::error::{Result, RozError};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Only http(s) endpoints are accepted.
pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(RozError::invalid_value(field_name, url_str, "URL cannot be empty"));
    }

    let url = Url::parse(url_str)
        .map_err(|e| RozError::invalid_value(field_name, url_str, format!("Invalid URL format: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RozError::invalid_value(
            field_name,
            url_str,
            format!("Unsupported URL scheme: {}", url.scheme()),
        ));
    }
    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value >= min_value {
        return Ok(());
    }
    Err(RozError::invalid_value(field_name, value, format!("Value must be at least {}", min_value)))
}

/// Borrow a required setting, reporting it by `field_name` when absent.
pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| RozError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RozError::invalid_value(field_name, value, "Value cannot be empty or whitespace-only"));
    }
    Ok(())
}

/// S3 bucket naming rules: 3-63 chars, lowercase letters, digits, `-` and `.`,
/// no leading or trailing hyphen.
pub fn validate_s3_bucket_name(field_name: &str, bucket_name: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';

    let reason = if !(3..=63).contains(&bucket_name.len()) {
        "S3 bucket name must be between 3 and 63 characters"
    } else if !bucket_name.chars().all(allowed) {
        "S3 bucket name can only contain lowercase letters, numbers, hyphens, and dots"
    } else if bucket_name.starts_with('-') || bucket_name.ends_with('-') {
        "S3 bucket name cannot start or end with a hyphen"
    } else {
        return Ok(());
    };

    Err(RozError::invalid_value(field_name, bucket_name, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("onyx.domain", "https://onyx.example.com").is_ok());
        assert!(validate_url("onyx.domain", "http://localhost:8000").is_ok());
        assert!(validate_url("onyx.domain", "").is_err());
        assert!(validate_url("onyx.domain", "invalid-url").is_err());
        assert!(validate_url("onyx.domain", "ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("n_workers", 5, 1).is_ok());
        assert!(validate_positive_number("n_workers", 0, 1).is_err());
    }

    #[test]
    fn test_validate_s3_bucket_name() {
        assert!(validate_s3_bucket_name("bucket", "mscape-birm-ont-prod").is_ok());
        assert!(validate_s3_bucket_name("bucket", "ab").is_err());
        assert!(validate_s3_bucket_name("bucket", "Mscape-birm").is_err());
        assert!(validate_s3_bucket_name("bucket", "mscape_birm").is_err());
        assert!(validate_s3_bucket_name("bucket", "-mscape").is_err());
    }

    #[test]
    fn test_validate_required_field() {
        let present = Some("value".to_string());
        let missing: Option<String> = None;
        assert_eq!(validate_required_field("a", &present).unwrap(), "value");
        assert!(matches!(
            validate_required_field("ONYX_ROZ_PASSWORD", &missing),
            Err(RozError::MissingConfigError { .. })
        ));
    }
}
