//! Mail transport seams — outbound SMTP and inbound mailbox access.
//!
//! The engine talks to mail providers only through the `MailTransport`
//! and `MailboxReader` traits so tests can swap in-process fakes and the
//! protocol plumbing stays out of the scheduling logic.

pub mod imap;
pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{MailboxError, TransportError};
use crate::model::EmailAccount;

pub use imap::ImapMailboxReader;
pub use smtp::SmtpMailer;

/// A fully rendered outbound message.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Receipt for a successful dispatch.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Message-ID placed on the wire; inbound replies reference it.
    pub message_id: String,
}

/// A parsed inbound message.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    /// Mailbox-native sequence identifier.
    pub uid: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Lightweight listing entry from a marker search.
#[derive(Debug, Clone)]
pub struct MailboxSummary {
    pub uid: String,
    pub seen: bool,
}

/// Outbound dispatch.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one message from the given account.
    async fn send(
        &self,
        account: &EmailAccount,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError>;

    /// Check the account's transport credentials; used to flip an errored
    /// account back to active.
    async fn verify(&self, account: &EmailAccount) -> Result<(), TransportError>;
}

/// Inbound mailbox access.
#[async_trait]
pub trait MailboxReader: Send + Sync {
    /// Messages that arrived in the inbox at or after `since`
    /// (everything available when `since` is `None`).
    async fn fetch_since(
        &self,
        account: &EmailAccount,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundEmail>, MailboxError>;

    /// Mark a message as read.
    async fn mark_read(
        &self,
        account: &EmailAccount,
        folder: &str,
        uid: &str,
    ) -> Result<(), MailboxError>;

    /// Move a message out of `folder` into the inbox.
    async fn move_to_inbox(
        &self,
        account: &EmailAccount,
        folder: &str,
        uid: &str,
    ) -> Result<(), MailboxError>;

    /// Messages in `folder` whose subject contains `marker`.
    async fn find_by_subject_marker(
        &self,
        account: &EmailAccount,
        folder: &str,
        marker: &str,
    ) -> Result<Vec<MailboxSummary>, MailboxError>;
}
