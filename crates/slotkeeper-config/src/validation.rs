//! Configuration validation

use crate::schema::{RawConfig, RawServiceConfig, RawSlotsConfig};
use slotkeeper_util::{MAX_SLOT_COUNT, SlotId};
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

/// Shortest admin token accepted
pub const MIN_ADMIN_TOKEN_LEN: usize = 8;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("heartbeat_seconds must be greater than zero")]
    ZeroHeartbeat,

    #[error("Invalid tcp_listen address '{value}': {message}")]
    InvalidListenAddress { value: String, message: String },

    #[error("admin_token must be at least {min} characters", min = MIN_ADMIN_TOKEN_LEN)]
    AdminTokenTooShort,

    #[error("fleet size {0} exceeds the maximum of {max}", max = MAX_SLOT_COUNT)]
    TooManySlots(u32),

    #[error("Slot id '{value}': {message}")]
    InvalidSlotId { value: String, message: String },

    #[error("Duplicate slot ID: {0}")]
    DuplicateSlotId(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_service(&config.service);
    errors.extend(validate_slots(&config.slots));
    errors
}

fn validate_service(service: &RawServiceConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if service.heartbeat_seconds == Some(0) {
        errors.push(ValidationError::ZeroHeartbeat);
    }

    if let Some(addr) = &service.tcp_listen
        && let Err(e) = addr.parse::<SocketAddr>()
    {
        errors.push(ValidationError::InvalidListenAddress {
            value: addr.clone(),
            message: e.to_string(),
        });
    }

    if let Some(token) = &service.admin_token
        && token.trim().chars().count() < MIN_ADMIN_TOKEN_LEN
    {
        errors.push(ValidationError::AdminTokenTooShort);
    }

    errors
}

fn validate_slots(slots: &RawSlotsConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(count) = slots.initial_count
        && count > MAX_SLOT_COUNT
    {
        errors.push(ValidationError::TooManySlots(count));
    }

    if let Some(ids) = &slots.ids {
        if ids.len() > MAX_SLOT_COUNT as usize {
            errors.push(ValidationError::TooManySlots(ids.len() as u32));
        }

        let mut seen = HashSet::new();
        for raw in ids {
            match SlotId::parse(raw) {
                Ok(id) => {
                    if !seen.insert(id.clone()) {
                        errors.push(ValidationError::DuplicateSlotId(id.to_string()));
                    }
                }
                Err(e) => errors.push(ValidationError::InvalidSlotId {
                    value: raw.clone(),
                    message: e.to_string(),
                }),
            }
        }
    }

    errors
}
