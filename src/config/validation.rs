use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{HandlerConfig, HealthCheckConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate {what}: {value}")]
    Duplicate { what: String, value: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_health_check_config(&config.health_check) {
            errors.push(e);
        }

        let mut keys = HashSet::new();
        for handler in &config.handlers {
            if handler.key.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "handlers[].key".to_string(),
                });
            } else if !keys.insert(handler.key.as_str()) {
                errors.push(ValidationError::Duplicate {
                    what: "handler key".to_string(),
                    value: handler.key.clone(),
                });
            }
            errors.extend(Self::validate_handler(handler));
        }

        if let Some(default) = &config.default_handler {
            if !default.is_empty() && !keys.contains(default.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: "default_handler".to_string(),
                    message: format!("no handler with key '{default}'"),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> ValidationResult<()> {
        if config.enabled && config.interval_secs == 0 {
            return Err(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }
        Ok(())
    }

    fn validate_handler(handler: &HandlerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let key = &handler.key;

        for route in &handler.routes {
            if !route.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("handler '{key}' route '{route}'"),
                    message: "Route paths must start with '/'".to_string(),
                });
            }
        }

        let mut targets = HashSet::new();
        for host in &handler.hosts {
            if let Err(e) = Self::validate_url(&host.target, &format!("handler '{key}' target")) {
                errors.push(e);
            }
            if !targets.insert(host.target.as_str()) {
                errors.push(ValidationError::Duplicate {
                    what: format!("target in handler '{key}'"),
                    value: host.target.clone(),
                });
            }
            if let Some(health) = host.health.as_deref().filter(|h| !h.is_empty()) {
                if let Err(e) = Self::validate_url(health, &format!("handler '{key}' health")) {
                    errors.push(e);
                }
            }
        }

        // duration and header parsing share the conversion used at runtime
        if let Err(e) = handler.to_definition() {
            errors.push(e);
        }

        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
