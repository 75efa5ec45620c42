use super::models::Config;
use crate::signing::mutator::MAX_RESERVED_BYTES;
use crate::tsa::der;
use crate::tsa::http::validate_url;
use thiserror::Error;

/// Smallest `/Contents` reservation accepted
const MIN_RESERVED_BYTES: u64 = 1024;

const MAX_ATTEMPTS_LIMIT: u32 = 10;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid TSA URL '{url}': {reason}")]
    InvalidTsaUrl { url: String, reason: String },

    #[error("Output suffix must not be empty")]
    EmptyOutputSuffix,

    #[error("Output suffix '{0}' must not contain path separators")]
    InvalidOutputSuffix(String),

    #[error("Signature field name must not be empty")]
    EmptyFieldName,

    #[error("max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("Timeout must be positive: {field}")]
    ZeroTimeout { field: String },

    #[error("reserved_bytes ({actual}) must be between {min} and {max}")]
    ReservedBytesOutOfRange { actual: u64, min: u64, max: u64 },

    #[error("Invalid policy OID '{0}'")]
    InvalidPolicyOid(String),
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_batch(config)?;
    validate_tsa(config)?;
    validate_signature(config)?;
    Ok(())
}

fn validate_batch(config: &Config) -> Result<(), ValidationError> {
    let batch = &config.batch;

    validate_url(&batch.tsa_url).map_err(|e| ValidationError::InvalidTsaUrl {
        url: batch.tsa_url.clone(),
        reason: e.to_string(),
    })?;

    if batch.output_suffix.is_empty() {
        return Err(ValidationError::EmptyOutputSuffix);
    }
    if batch.output_suffix.contains(['/', '\\']) {
        return Err(ValidationError::InvalidOutputSuffix(batch.output_suffix.clone()));
    }

    if batch.field_name.trim().is_empty() {
        return Err(ValidationError::EmptyFieldName);
    }

    Ok(())
}

fn validate_tsa(config: &Config) -> Result<(), ValidationError> {
    let tsa = &config.tsa;

    if tsa.max_attempts == 0 || tsa.max_attempts > MAX_ATTEMPTS_LIMIT {
        return Err(ValidationError::InvalidMaxAttempts(tsa.max_attempts));
    }

    for (field, value) in [
        ("tsa.connect_timeout", tsa.connect_timeout),
        ("tsa.request_timeout", tsa.request_timeout),
    ] {
        if value.as_duration().is_zero() {
            return Err(ValidationError::ZeroTimeout {
                field: field.to_string(),
            });
        }
    }

    if let Some(oid) = &tsa.policy_oid {
        der::oid(oid).map_err(|_| ValidationError::InvalidPolicyOid(oid.clone()))?;
    }

    Ok(())
}

fn validate_signature(config: &Config) -> Result<(), ValidationError> {
    let actual = config.signature.reserved_bytes.as_u64();
    if !(MIN_RESERVED_BYTES..=MAX_RESERVED_BYTES).contains(&actual) {
        return Err(ValidationError::ReservedBytesOutOfRange {
            actual,
            min: MIN_RESERVED_BYTES,
            max: MAX_RESERVED_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::{ByteSize, HumanDuration};

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_tsa_url_must_be_http() {
        let mut config = Config::default();
        config.batch.tsa_url = "ftp://tsa.example.com".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidTsaUrl { .. })
        ));

        config.batch.tsa_url = "   ".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidTsaUrl { .. })
        ));
    }

    #[test]
    fn test_output_suffix_rules() {
        let mut config = Config::default();
        config.batch.output_suffix = String::new();
        assert!(matches!(validate(&config), Err(ValidationError::EmptyOutputSuffix)));

        config.batch.output_suffix = "/../x".into();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidOutputSuffix(_))
        ));
    }

    #[test]
    fn test_tsa_limits() {
        let mut config = Config::default();
        config.tsa.max_attempts = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidMaxAttempts(0))));

        let mut config = Config::default();
        config.tsa.request_timeout = HumanDuration::from_secs(0);
        assert!(matches!(validate(&config), Err(ValidationError::ZeroTimeout { .. })));

        let mut config = Config::default();
        config.tsa.policy_oid = Some("not.an.oid".into());
        assert!(matches!(validate(&config), Err(ValidationError::InvalidPolicyOid(_))));
    }

    #[test]
    fn test_reserved_bytes_range() {
        let mut config = Config::default();
        config.signature.reserved_bytes = ByteSize(100);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ReservedBytesOutOfRange { actual: 100, .. })
        ));
    }
}
