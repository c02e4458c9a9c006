// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod classify;
pub mod client;
pub mod composer;
pub mod manager;
pub mod pool;
