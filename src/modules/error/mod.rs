// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::raise_error;
use bb8::RunError;
use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RelayMailError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type RelayMailResult<T, E = RelayMailError> = std::result::Result<T, E>;

impl RelayMailError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayMailError::Generic { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RelayMailError::Generic { message, .. } => message,
        }
    }
}

impl From<RunError<RelayMailError>> for RelayMailError {
    fn from(e: RunError<RelayMailError>) -> Self {
        match e {
            RunError::User(e) => e,
            RunError::TimedOut => raise_error!(
                "Timed out while attempting to acquire a connection from the pool".into(),
                ErrorCode::ConnectionPoolTimeout
            ),
        }
    }
}
