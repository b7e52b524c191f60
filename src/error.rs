//! Error types for the outreach engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Authentication failed for account {account}")]
    AuthFailed { account: String },

    #[error("Connection to {host} failed for account {account}: {reason}")]
    ConnectFailed {
        account: String,
        host: String,
        reason: String,
    },

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message for account {account}: {reason}")]
    BuildFailed { account: String, reason: String },

    #[error("Send failed for account {account}: {reason}")]
    SendFailed { account: String, reason: String },

    #[error("Verification failed for account {account}: {reason}")]
    VerifyFailed { account: String, reason: String },
}

impl TransportError {
    /// Whether this failure indicates an account-level outage (the account
    /// should drop out of rotation) rather than a one-off message failure.
    pub fn is_account_level(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed { .. } | Self::ConnectFailed { .. } | Self::VerifyFailed { .. }
        )
    }
}

/// Mailbox (IMAP) access errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Login failed for {account}")]
    LoginFailed { account: String },

    #[error("Command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Campaign misconfiguration errors.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign {id} has no sequence steps")]
    NoSequenceSteps { id: Uuid },

    #[error("Campaign {id} has no assigned sending accounts")]
    NoAccounts { id: Uuid },

    #[error("Campaign {id} has no leads")]
    NoLeads { id: Uuid },

    #[error("Campaign {id} cannot transition to {target}: {reason}")]
    InvalidTransition {
        id: Uuid,
        target: String,
        reason: String,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
