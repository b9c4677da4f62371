use std::collections::HashSet;

use http::Uri;

use crate::config::models::GatewayConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid target URL '{url}' in upstream '{upstream}': {reason}")]
    InvalidTargetUrl {
        upstream: String,
        url: String,
        reason: String,
    },

    #[error("Duplicate upstream name: {name}")]
    DuplicateUpstream { name: String },

    #[error("Route '{route}' references unknown upstream '{upstream}'")]
    UnknownUpstream { route: String, upstream: String },

    #[error("Validation failed:\n{message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator.
///
/// Collects every violation before reporting so a broken config file can be
/// fixed in one pass. Must hold before startup:
/// * server port is non-zero
/// * at least one route is defined
/// * upstream names are unique and every upstream has at least one target
/// * every route's upstream name resolves
/// * every target URL parses as an absolute URI with scheme and authority
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.server.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.port".to_string(),
                message: "port must be in range 1..=65535".to_string(),
            });
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }

        let mut upstream_names = HashSet::new();
        for upstream in &config.upstreams {
            if upstream.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "upstreams[].name".to_string(),
                });
                continue;
            }
            if !upstream_names.insert(upstream.name.as_str()) {
                errors.push(ValidationError::DuplicateUpstream {
                    name: upstream.name.clone(),
                });
            }

            if upstream.targets.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("upstream '{}' targets", upstream.name),
                    message: "at least one target is required".to_string(),
                });
            }
            for target in &upstream.targets {
                if let Err(reason) = Self::validate_target_url(&target.url) {
                    errors.push(ValidationError::InvalidTargetUrl {
                        upstream: upstream.name.clone(),
                        url: target.url.clone(),
                        reason,
                    });
                }
            }

            if let Some(hc) = &upstream.health_check {
                if hc.interval.is_zero() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("upstream '{}' health_check.interval", upstream.name),
                        message: "interval must be greater than zero".to_string(),
                    });
                }
                if hc.timeout.is_zero() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("upstream '{}' health_check.timeout", upstream.name),
                        message: "timeout must be greater than zero".to_string(),
                    });
                }
                if !hc.path.starts_with('/') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("upstream '{}' health_check.path", upstream.name),
                        message: "path must start with '/'".to_string(),
                    });
                }
            }
        }

        for route in &config.routes {
            let label = if route.name.is_empty() {
                route.path.clone()
            } else {
                route.name.clone()
            };

            if route.path.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("route '{label}' path"),
                });
            }
            if route.upstream.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("route '{label}' upstream"),
                });
            } else if !upstream_names.contains(route.upstream.as_str()) {
                errors.push(ValidationError::UnknownUpstream {
                    route: label,
                    upstream: route.upstream.clone(),
                });
            }
        }

        if config.metrics.enabled {
            if config.metrics.port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "metrics.port".to_string(),
                    message: "port must be in range 1..=65535".to_string(),
                });
            }
            if !config.metrics.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: "metrics.path".to_string(),
                    message: "path must start with '/'".to_string(),
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

    /// A target URL must be absolute: scheme and authority present.
    fn validate_target_url(url: &str) -> Result<(), String> {
        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| e.to_string())?;
        match (uri.scheme_str(), uri.authority()) {
            (Some("http") | Some("https"), Some(_)) => Ok(()),
            (Some(other), _) => Err(format!("unsupported scheme '{other}'")),
            _ => Err("URL must be absolute with scheme and authority".to_string()),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .map(|e| format!("  - {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
