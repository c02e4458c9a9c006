use crate::modules::error::code::ErrorCode;
use crate::modules::error::{RelayMailError, RelayMailResult};
use mail_send::smtp::message::IntoMessage;
use mail_send::SmtpClient;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pub enum RelaySmtpClient {
    Plain(SmtpClient<TcpStream>),
    Tls(SmtpClient<TlsStream<TcpStream>>),
}

pub(crate) trait Sender {
    async fn send_noop(&mut self) -> RelayMailResult<()>;
    async fn reset(&mut self) -> RelayMailResult<()>;
    async fn send_email<'x>(&mut self, message: impl IntoMessage<'x>) -> RelayMailResult<()>;
}

impl Sender for RelaySmtpClient {
    async fn send_noop(&mut self) -> RelayMailResult<()> {
        match self {
            RelaySmtpClient::Plain(smtp_client) => {
                smtp_client.noop().await.map_err(map_command_error)
            }
            RelaySmtpClient::Tls(smtp_client) => {
                smtp_client.noop().await.map_err(map_command_error)
            }
        }
    }

    async fn reset(&mut self) -> RelayMailResult<()> {
        match self {
            RelaySmtpClient::Plain(smtp_client) => {
                smtp_client.rset().await.map_err(map_command_error)
            }
            RelaySmtpClient::Tls(smtp_client) => {
                smtp_client.rset().await.map_err(map_command_error)
            }
        }
    }

    async fn send_email<'x>(&mut self, message: impl IntoMessage<'x>) -> RelayMailResult<()> {
        match self {
            RelaySmtpClient::Plain(smtp_client) => {
                smtp_client.send(message).await.map_err(map_command_error)
            }
            RelaySmtpClient::Tls(smtp_client) => {
                smtp_client.send(message).await.map_err(map_command_error)
            }
        }
    }
}

/// Map a protocol-level failure onto the engine's error codes. The full
/// error debug text is preserved so the retry classifier can pull the SMTP
/// reply code out of it.
pub(crate) fn map_command_error(e: mail_send::Error) -> RelayMailError {
    let code = match &e {
        mail_send::Error::AuthenticationFailed(_) => ErrorCode::SmtpAuthenticationFailed,
        mail_send::Error::Timeout => ErrorCode::ConnectionTimeout,
        mail_send::Error::Io(_) => ErrorCode::NetworkError,
        mail_send::Error::MissingStartTls => ErrorCode::TlsNegotiationFailed,
        _ => ErrorCode::SmtpCommandFailed,
    };
    crate::raise_error!(format!("{:#?}", e), code)
}

pub(crate) fn map_connect_error(e: mail_send::Error) -> RelayMailError {
    let code = match &e {
        mail_send::Error::AuthenticationFailed(_) => ErrorCode::SmtpAuthenticationFailed,
        mail_send::Error::Timeout => ErrorCode::ConnectionTimeout,
        mail_send::Error::MissingStartTls => ErrorCode::TlsNegotiationFailed,
        _ => ErrorCode::SmtpConnectionFailed,
    };
    crate::raise_error!(format!("{:#?}", e), code)
}
