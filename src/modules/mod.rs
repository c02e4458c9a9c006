// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod account;
pub mod attachment;
pub mod cache;
pub mod cleanup;
pub mod common;
pub mod coordinator;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod logger;
pub mod message;
pub mod report;
pub mod sendlog;
pub mod settings;
pub mod smtp;
pub mod store;
pub mod tenant;
pub mod utils;
