//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backend groups)
//! - Validate value ranges (buffer sizes, backend limit, addresses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::RelayConfig;
use crate::processor::ConnId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid {field} address '{value}'")]
    InvalidAddress { field: String, value: String },
    #[error("route '{route}' references unknown backend group '{group}'")]
    UnknownGroup { route: String, group: String },
    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_backends_per_session must be within 1..={max}, got {value}")]
    BackendLimit { value: u16, max: u16 },
}

pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address".to_string(),
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }
    if config.relay.in_buffer_size == 0 {
        errors.push(ValidationError::Zero("relay.in_buffer_size"));
    }
    if config.relay.out_buffer_size == 0 {
        errors.push(ValidationError::Zero("relay.out_buffer_size"));
    }
    let limit = config.relay.max_backends_per_session;
    if limit == 0 || limit > ConnId::MAX_BACKEND {
        errors.push(ValidationError::BackendLimit {
            value: limit,
            max: ConnId::MAX_BACKEND,
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address".to_string(),
            value: config.observability.metrics_address.clone(),
        });
    }

    let mut names = HashSet::new();
    let mut groups = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        if backend.address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                field: format!("backend '{}'", backend.name),
                value: backend.address.clone(),
            });
        }
        groups.insert(backend.group.as_str());
    }

    for route in &config.routes {
        if !groups.contains(route.backend_group.as_str()) {
            errors.push(ValidationError::UnknownGroup {
                route: route.name.clone(),
                group: route.backend_group.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
