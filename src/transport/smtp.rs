//! SMTP implementation of `MailTransport` via lettre.
//!
//! A transport is built per send from the account's relay settings; the
//! blocking lettre client runs under `spawn_blocking`.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::error::TransportError;
use crate::model::EmailAccount;
use crate::transport::{MailTransport, OutboundMessage, SendReceipt};

/// lettre-backed SMTP transport.
#[derive(Debug, Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        Self
    }

    fn build_transport(account: &EmailAccount) -> Result<SmtpTransport, TransportError> {
        let creds = Credentials::new(
            account.username.clone(),
            account.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&account.smtp_host)
            .map_err(|e| TransportError::ConnectFailed {
                account: account.address.clone(),
                host: account.smtp_host.clone(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(account.smtp_port)
            .credentials(creds)
            .build();

        Ok(transport)
    }

    /// Sort an SMTP failure into the engine's taxonomy. Auth rejections
    /// and connection failures are account-level; anything else is a
    /// one-off message failure.
    fn classify_send_error(account: &EmailAccount, error: &str) -> TransportError {
        let lower = error.to_lowercase();
        if lower.contains("535") || lower.contains("authentication") || lower.contains("password") {
            TransportError::AuthFailed {
                account: account.address.clone(),
            }
        } else if lower.contains("connection") || lower.contains("timed out") {
            TransportError::ConnectFailed {
                account: account.address.clone(),
                host: account.smtp_host.clone(),
                reason: error.to_string(),
            }
        } else {
            TransportError::SendFailed {
                account: account.address.clone(),
                reason: error.to_string(),
            }
        }
    }
}

/// Generate the Message-ID placed on the wire, keyed to the sender's
/// domain so replies can be attributed.
fn generate_message_id(from_address: &str) -> String {
    let domain = from_address.split('@').nth(1).unwrap_or("outflow.local");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        account: &EmailAccount,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError> {
        let account = account.clone();
        let message = message.clone();

        tokio::task::spawn_blocking(move || {
            let message_id = generate_message_id(&account.address);

            let from = format!("{} <{}>", account.display_name, account.address)
                .trim()
                .parse()
                .map_err(|e| TransportError::InvalidAddress {
                    address: account.address.clone(),
                    reason: format!("{e}"),
                })?;

            let to = message
                .to
                .parse()
                .map_err(|e| TransportError::InvalidAddress {
                    address: message.to.clone(),
                    reason: format!("{e}"),
                })?;

            let email = Message::builder()
                .from(from)
                .to(to)
                .subject(&message.subject)
                .message_id(Some(message_id.clone()))
                .body(message.body.clone())
                .map_err(|e| TransportError::BuildFailed {
                    account: account.address.clone(),
                    reason: format!("{e}"),
                })?;

            let transport = Self::build_transport(&account)?;
            transport
                .send(&email)
                .map_err(|e| Self::classify_send_error(&account, &e.to_string()))?;

            tracing::debug!(
                account = %account.address,
                to = %message.to,
                "Message dispatched"
            );

            Ok(SendReceipt { message_id })
        })
        .await
        .map_err(|e| TransportError::SendFailed {
            account: "unknown".to_string(),
            reason: format!("Send task panicked: {e}"),
        })?
    }

    async fn verify(&self, account: &EmailAccount) -> Result<(), TransportError> {
        let account = account.clone();

        tokio::task::spawn_blocking(move || {
            let transport = Self::build_transport(&account)?;
            match transport.test_connection() {
                Ok(true) => Ok(()),
                Ok(false) => Err(TransportError::VerifyFailed {
                    account: account.address.clone(),
                    reason: "SMTP connection test returned false".to_string(),
                }),
                Err(e) => Err(TransportError::VerifyFailed {
                    account: account.address.clone(),
                    reason: e.to_string(),
                }),
            }
        })
        .await
        .map_err(|e| TransportError::VerifyFailed {
            account: "unknown".to_string(),
            reason: format!("Verify task panicked: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn account() -> EmailAccount {
        let mut a = EmailAccount::new("sender@example.com", SecretString::from("pw"));
        a.smtp_host = "smtp.example.com".to_string();
        a
    }

    #[test]
    fn message_id_uses_sender_domain() {
        let id = generate_message_id("user@example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
    }

    #[test]
    fn auth_errors_are_account_level() {
        let err = SmtpMailer::classify_send_error(&account(), "535 5.7.8 authentication failed");
        assert!(matches!(err, TransportError::AuthFailed { .. }));
        assert!(err.is_account_level());
    }

    #[test]
    fn connection_errors_are_account_level() {
        let err = SmtpMailer::classify_send_error(&account(), "connection refused");
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert!(err.is_account_level());
    }

    #[test]
    fn other_errors_are_message_level() {
        let err = SmtpMailer::classify_send_error(&account(), "552 mailbox full");
        assert!(matches!(err, TransportError::SendFailed { .. }));
        assert!(!err.is_account_level());
    }
}
