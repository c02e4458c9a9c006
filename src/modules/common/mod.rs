// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod auth;
pub mod periodic;
pub mod shutdown;
pub mod signal;
