use std::collections::HashSet;

use url::Url;

use crate::config::models::Config;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Service conflict detected: {message}")]
    ServiceConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Startup configuration validator. A failed validation is fatal: the process
/// must exit non-zero without binding the listener.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration, aggregating every problem
    /// into a single error message.
    pub fn validate(config: &Config) -> ValidationResult<()> {
        let mut errors = Vec::new();

        Self::validate_security(config, &mut errors);
        Self::validate_resilience(config, &mut errors);
        Self::validate_logging(config, &mut errors);
        Self::validate_services(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_security(config: &Config, errors: &mut Vec<ValidationError>) {
        let sec = &config.security;
        if sec.enable_jwt && sec.jwt_secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "security.jwt_secret".to_string(),
            });
        }
        if sec.enable_api_key && sec.api_keys.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "security.api_keys".to_string(),
            });
        }
        if sec.enable_tls {
            if sec.tls_cert_file.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "security.tls_cert_file".to_string(),
                });
            }
            if sec.tls_key_file.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "security.tls_key_file".to_string(),
                });
            }
        }
        if sec.enable_cors && sec.cors_allow_origins.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "security.cors_allow_origins".to_string(),
            });
        }
    }

    fn validate_resilience(config: &Config, errors: &mut Vec<ValidationError>) {
        let res = &config.resilience;
        if res.enable_circuit_breaker && res.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "resilience.failure_threshold".to_string(),
                message: "must be greater than 0 when the circuit breaker is enabled".to_string(),
            });
        }
        if res.enable_retry && res.max_retries == 0 {
            errors.push(ValidationError::InvalidField {
                field: "resilience.max_retries".to_string(),
                message: "must be greater than 0 when retry is enabled".to_string(),
            });
        }
        if config.rate_limit.enable && config.rate_limit.requests == 0 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limit.requests".to_string(),
                message: "must be greater than 0 when rate limiting is enabled".to_string(),
            });
        }
    }

    fn validate_logging(config: &Config, errors: &mut Vec<ValidationError>) {
        match config.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => errors.push(ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: format!("unknown level '{other}' (expected debug/info/warn/error)"),
            }),
        }
        match config.logging.format.as_str() {
            "json" | "console" => {}
            other => errors.push(ValidationError::InvalidField {
                field: "logging.format".to_string(),
                message: format!("unknown format '{other}' (expected json/console)"),
            }),
        }
    }

    fn validate_services(config: &Config, errors: &mut Vec<ValidationError>) {
        let mut seen_names = HashSet::new();
        let mut seen_paths = HashSet::new();

        for svc in &config.services {
            if svc.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "services[].name".to_string(),
                });
                continue;
            }
            if !seen_names.insert(svc.name.clone()) {
                errors.push(ValidationError::ServiceConflict {
                    message: format!("duplicate service name '{}'", svc.name),
                });
            }

            if svc.base_path.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("services[{}].base_path", svc.name),
                });
            }

            let normalized = crate::core::gateway::normalize_base_path(&svc.base_path);
            if !seen_paths.insert(normalized.clone()) {
                errors.push(ValidationError::ServiceConflict {
                    message: format!(
                        "base_path '{}' of service '{}' collides with another service",
                        normalized, svc.name
                    ),
                });
            }

            for target in &svc.targets {
                if let Err(e) = Self::validate_target(target) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("services[{}].targets", svc.name),
                        message: format!("'{target}': {e}"),
                    });
                }
            }
        }
    }

    fn validate_target(target: &str) -> Result<(), String> {
        let url = Url::parse(target).map_err(|e| e.to_string())?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(format!("unsupported scheme '{other}'")),
        }
        if url.host_str().is_none() {
            return Err("missing host".to_string());
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut lines = vec![format!("{} problem(s) found:", errors.len())];
        for (i, error) in errors.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, error));
        }
        lines.join("\n")
    }
}
