// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use rand::Rng;

use super::error::code::ErrorCode;

#[macro_export]
macro_rules! relaymail_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

/// Current UTC time as seconds since the Unix epoch.
///
/// Queue lifecycle fields (`deferred_ts`, `sent_ts`, `error_ts`,
/// `reported_ts`, send-log timestamps) all carry this unit.
#[macro_export]
macro_rules! utc_now {
    () => {{
        use chrono::Utc;
        Utc::now().timestamp()
    }};
}

#[macro_export]
macro_rules! base64_encode {
    ($bytes:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.encode($bytes)
    }};
}

#[macro_export]
macro_rules! base64_decode {
    ($key:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.decode($key)
    }};
}

#[macro_export]
macro_rules! raise_error {
    ($msg:expr, $code:expr) => {
        $crate::modules::error::RelayMailError::Generic {
            message: $msg,
            location: snafu::Location::default(),
            code: $code,
        }
    };
}

#[macro_export]
macro_rules! id {
    () => {{
        $crate::modules::utils::generate_key()
    }};
}

#[macro_export]
macro_rules! validate_email {
    ($email:expr) => {{
        $crate::modules::utils::validate_email($email)
    }};
}

/// Random 63-bit surrogate key for queue rows.
pub fn generate_key() -> u64 {
    rand::rng().random::<u64>() >> 1
}

pub fn validate_email(email: &str) -> crate::modules::error::RelayMailResult<()> {
    use std::str::FromStr;
    let email_address = email_address::EmailAddress::from_str(email).map_err(|_| {
        raise_error!(
            format!("Invalid email format : {}", email),
            ErrorCode::InvalidParameter
        )
    })?;
    if email != email_address.email() {
        return Err(raise_error!(
            format!("Invalid email format: {}", email),
            ErrorCode::InvalidParameter
        ));
    }
    Ok(())
}

pub fn validate_id(input: &str, param_name: &str) -> crate::modules::error::RelayMailResult<()> {
    if input.is_empty() {
        return Err(raise_error!(
            format!("'{}' cannot be empty.", param_name),
            ErrorCode::InvalidParameter
        ));
    }

    if input.len() > 128 {
        return Err(raise_error!(
            format!("'{}' cannot be longer than 128 characters.", param_name),
            ErrorCode::InvalidParameter
        ));
    }

    if input.chars().any(|c| c.is_control() || c == '\u{0}') {
        return Err(raise_error!(
            format!("'{}' must not contain control characters.", param_name),
            ErrorCode::InvalidParameter
        ));
    }
    Ok(())
}

pub fn sha256_hex(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
