use crate::config::Config;
use crate::error::{AppError, Result};

/// Shortest accepted idempotency key.
const IDEMPOTENCY_KEY_MIN: usize = 8;
/// Longest accepted idempotency key.
const IDEMPOTENCY_KEY_MAX: usize = 128;
/// Longest accepted owner label.
const OWNER_MAX: usize = 100;

/// Validates a client-supplied idempotency key.
///
/// # Arguments
///
/// * `key` - The idempotency key to validate.
///
/// # Returns
///
/// A `Result<()>` indicating whether the key is valid.
pub fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.len() < IDEMPOTENCY_KEY_MIN || key.len() > IDEMPOTENCY_KEY_MAX {
        return Err(AppError::Validation(format!(
            "Idempotency key must be between {} and {} characters",
            IDEMPOTENCY_KEY_MIN, IDEMPOTENCY_KEY_MAX
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "Idempotency key can only contain letters, numbers, underscores, and hyphens"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validates an optional owner label.
pub fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(AppError::Validation("Owner must not be empty".to_string()));
    }

    if owner.len() > OWNER_MAX {
        return Err(AppError::Validation(format!(
            "Owner must be at most {} characters",
            OWNER_MAX
        )));
    }

    Ok(())
}

/// Validates the payload size against the configured maximum.
pub fn validate_payload_size(config: &Config, size: usize) -> Result<()> {
    if size == 0 {
        return Err(AppError::Validation(
            "Empty payloads are not accepted".to_string(),
        ));
    }

    if size as u64 > config.max_file_size {
        return Err(AppError::TooLarge {
            size: size as u64,
            max: config.max_file_size,
        });
    }

    Ok(())
}

/// Validates a content type against the configured allowlist of MIME
/// prefixes.
pub fn validate_content_type(config: &Config, content_type: &str) -> Result<()> {
    let normalized = content_type.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(AppError::Validation(
            "Content type must not be empty".to_string(),
        ));
    }

    let allowed = config
        .allowed_content_types
        .iter()
        .any(|prefix| normalized.starts_with(prefix.as_str()));

    if !allowed {
        return Err(AppError::UnsupportedType(content_type.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_bounds() {
        assert!(validate_idempotency_key("abcd1234").is_ok());
        assert!(validate_idempotency_key("short").is_err());
        assert!(validate_idempotency_key(&"x".repeat(129)).is_err());
        assert!(validate_idempotency_key("has spaces!").is_err());
        assert!(validate_idempotency_key("under_score-ok").is_ok());
    }

    #[test]
    fn content_type_allowlist_is_prefix_based() {
        let config = Config::for_memory_mode();
        assert!(validate_content_type(&config, "text/plain").is_ok());
        assert!(validate_content_type(&config, "IMAGE/PNG").is_ok());
        assert!(validate_content_type(&config, "application/pdf").is_ok());
        assert!(validate_content_type(&config, "video/mp4").is_err());
        assert!(validate_content_type(&config, "").is_err());
    }

    #[test]
    fn payload_size_limits() {
        let mut config = Config::for_memory_mode();
        config.max_file_size = 10;
        assert!(validate_payload_size(&config, 0).is_err());
        assert!(validate_payload_size(&config, 10).is_ok());
        assert!(matches!(
            validate_payload_size(&config, 11),
            Err(AppError::TooLarge { size: 11, max: 10 })
        ));
    }
}
