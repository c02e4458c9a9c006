// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::account::{Account, Encryption};
use crate::modules::error::RelayMailResult;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::smtp::client::{map_connect_error, RelaySmtpClient, Sender};
use mail_send::{Credentials, SmtpClientBuilder};
use std::time::Duration;

/// Builds authenticated SMTP sessions for one account; plugged into bb8 as
/// the pool's connection factory.
pub struct SmtpClientManager {
    account: Account,
}

impl SmtpClientManager {
    pub fn new(account: Account) -> Self {
        Self { account }
    }

    pub async fn build(&self) -> RelayMailResult<RelaySmtpClient> {
        let account = &self.account;
        let timeout = Duration::from_secs(SETTINGS.relaymail_smtp_timeout);
        let mut builder =
            SmtpClientBuilder::new(account.host.clone(), account.port).timeout(timeout);
        if let (Some(username), Some(password)) = (&account.username, &account.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let client = match account.encryption {
            Encryption::Implicit => {
                let client = builder
                    .implicit_tls(true)
                    .connect()
                    .await
                    .map_err(map_connect_error)?;
                RelaySmtpClient::Tls(client)
            }
            Encryption::StartTls => {
                let client = builder
                    .implicit_tls(false)
                    .connect()
                    .await
                    .map_err(map_connect_error)?;
                RelaySmtpClient::Tls(client)
            }
            Encryption::None => {
                let client = builder.connect_plain().await.map_err(map_connect_error)?;
                RelaySmtpClient::Plain(client)
            }
        };

        Ok(client)
    }
}

impl bb8::ManageConnection for SmtpClientManager {
    type Connection = RelaySmtpClient;
    type Error = crate::modules::error::RelayMailError;

    async fn connect(&self) -> RelayMailResult<Self::Connection> {
        self.build().await
    }

    // call this function before using the connection
    async fn is_valid(&self, conn: &mut Self::Connection) -> RelayMailResult<()> {
        conn.send_noop().await?;
        conn.reset().await
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}
