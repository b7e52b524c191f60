//! Raw IMAP-over-TLS implementation of `MailboxReader`.
//!
//! Line-oriented tagged commands over a rustls stream; blocking, so every
//! trait method runs the protocol under `spawn_blocking`. Each call opens
//! a fresh session — mailbox checks are minutes apart, so connection
//! reuse buys nothing and stale-session handling costs plenty.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;

use crate::error::MailboxError;
use crate::model::EmailAccount;
use crate::transport::{InboundEmail, MailboxReader, MailboxSummary};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw IMAP mailbox reader.
#[derive(Debug, Default)]
pub struct ImapMailboxReader;

impl ImapMailboxReader {
    pub fn new() -> Self {
        Self
    }
}

// ── Blocking IMAP session ───────────────────────────────────────────

struct ImapSession {
    tls: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag_counter: u32,
}

impl ImapSession {
    /// Connect, read the greeting, and log in.
    fn connect(account: &EmailAccount) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((&*account.imap_host, account.imap_port)).map_err(|e| {
            MailboxError::ConnectFailed {
                host: account.imap_host.clone(),
                port: account.imap_port,
                reason: e.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(account.imap_host.clone())
                .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self {
            tls,
            tag_counter: 1,
        };

        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            account.username,
            account.password.expose_secret()
        ))?;
        if !response_ok(&login) {
            return Err(MailboxError::LoginFailed {
                account: account.address.clone(),
            });
        }

        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => {
                    return Err(MailboxError::CommandFailed {
                        command: "read".to_string(),
                        reason: "connection closed".to_string(),
                    });
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect lines up to the tagged response.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;

        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("SELECT \"{folder}\""))?;
        if response_ok(&resp) {
            Ok(())
        } else {
            Err(MailboxError::CommandFailed {
                command: format!("SELECT {folder}"),
                reason: resp.last().cloned().unwrap_or_default(),
            })
        }
    }

    /// Run a SEARCH and collect the matching sequence numbers.
    fn search(&mut self, query: &str) -> Result<Vec<String>, MailboxError> {
        let resp = self.command(&format!("SEARCH {query}"))?;
        let mut uids = Vec::new();
        for line in &resp {
            if line.starts_with("* SEARCH") {
                uids.extend(
                    line.split_whitespace()
                        .skip(2)
                        .map(|s| s.trim().to_string()),
                );
            }
        }
        Ok(uids)
    }

    fn fetch_rfc822(&mut self, uid: &str) -> Result<String, MailboxError> {
        let resp = self.command(&format!("FETCH {uid} RFC822"))?;
        // Drop the untagged FETCH preamble and the tagged completion line.
        Ok(resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect())
    }

    fn fetch_seen_flag(&mut self, uid: &str) -> Result<bool, MailboxError> {
        let resp = self.command(&format!("FETCH {uid} (FLAGS)"))?;
        Ok(resp.iter().any(|l| l.contains("\\Seen")))
    }

    fn store_seen(&mut self, uid: &str) -> Result<(), MailboxError> {
        self.command(&format!("STORE {uid} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    /// COPY to INBOX then delete+expunge the original. EXPUNGE renumbers
    /// higher sequence numbers — callers moving several messages must go
    /// highest-first.
    fn move_to_inbox(&mut self, uid: &str) -> Result<(), MailboxError> {
        let copy = self.command(&format!("COPY {uid} \"INBOX\""))?;
        if !response_ok(&copy) {
            return Err(MailboxError::CommandFailed {
                command: format!("COPY {uid} INBOX"),
                reason: copy.last().cloned().unwrap_or_default(),
            });
        }
        self.command(&format!("STORE {uid} +FLAGS (\\Deleted)"))?;
        self.command("EXPUNGE")?;
        Ok(())
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

fn response_ok(lines: &[String]) -> bool {
    lines.last().is_some_and(|l| l.contains("OK"))
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Strip HTML tags and collapse whitespace (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_inbound(uid: &str, raw: &str) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw.as_bytes())?;

    let from_address = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let subject = parsed.subject().unwrap_or("").to_string();

    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(html.as_ref())
    } else {
        String::new()
    };

    let message_id = parsed
        .message_id()
        .map(|s| format!("<{s}>"))
        .unwrap_or_else(|| format!("imap-{uid}-{}", uuid::Uuid::new_v4()));

    let in_reply_to = parsed
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| format!("<{s}>")));

    let received_at = parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
                })
                .map(|n| n.and_utc())
        })
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        uid: uid.to_string(),
        message_id,
        in_reply_to,
        from_address,
        subject,
        body,
        received_at,
    })
}

// ── MailboxReader implementation ────────────────────────────────────

#[async_trait]
impl MailboxReader for ImapMailboxReader {
    async fn fetch_since(
        &self,
        account: &EmailAccount,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundEmail>, MailboxError> {
        let account = account.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&account)?;
            session.select("INBOX")?;

            // IMAP SINCE has day granularity; the exact cut is re-applied
            // below on the parsed Date header.
            let query = match since {
                Some(ts) => format!("SINCE {}", ts.format("%d-%b-%Y")),
                None => "ALL".to_string(),
            };
            let uids = session.search(&query)?;

            let mut messages = Vec::new();
            for uid in &uids {
                let raw = match session.fetch_rfc822(uid) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(account = %account.address, uid = %uid, "Fetch failed: {e}");
                        continue;
                    }
                };
                if let Some(mail) = parse_inbound(uid, &raw) {
                    if since.is_none_or(|ts| mail.received_at >= ts) {
                        messages.push(mail);
                    }
                }
            }

            session.logout();
            Ok(messages)
        })
        .await
        .map_err(|e| MailboxError::CommandFailed {
            command: "fetch_since".to_string(),
            reason: format!("task panicked: {e}"),
        })?
    }

    async fn mark_read(
        &self,
        account: &EmailAccount,
        folder: &str,
        uid: &str,
    ) -> Result<(), MailboxError> {
        let account = account.clone();
        let folder = folder.to_string();
        let uid = uid.to_string();

        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&account)?;
            session.select(&folder)?;
            session.store_seen(&uid)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailboxError::CommandFailed {
            command: "mark_read".to_string(),
            reason: format!("task panicked: {e}"),
        })?
    }

    async fn move_to_inbox(
        &self,
        account: &EmailAccount,
        folder: &str,
        uid: &str,
    ) -> Result<(), MailboxError> {
        let account = account.clone();
        let folder = folder.to_string();
        let uid = uid.to_string();

        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&account)?;
            session.select(&folder)?;
            session.move_to_inbox(&uid)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailboxError::CommandFailed {
            command: "move_to_inbox".to_string(),
            reason: format!("task panicked: {e}"),
        })?
    }

    async fn find_by_subject_marker(
        &self,
        account: &EmailAccount,
        folder: &str,
        marker: &str,
    ) -> Result<Vec<MailboxSummary>, MailboxError> {
        let account = account.clone();
        let folder = folder.to_string();
        let marker = marker.to_string();

        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&account)?;
            session.select(&folder)?;
            let uids = session.search(&format!("SUBJECT \"{marker}\""))?;

            let mut summaries = Vec::new();
            for uid in uids {
                let seen = session.fetch_seen_flag(&uid).unwrap_or(false);
                summaries.push(MailboxSummary { uid, seen });
            }

            session.logout();
            Ok(summaries)
        })
        .await
        .map_err(|e| MailboxError::CommandFailed {
            command: "find_by_subject_marker".to_string(),
            reason: format!("task panicked: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html("No HTML here"), "No HTML here");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn parse_inbound_extracts_reply_headers() {
        let raw = "Message-ID: <reply-1@their.mail>\r\n\
                   In-Reply-To: <sent-1@our.mail>\r\n\
                   From: Jane Prospect <jane@their.com>\r\n\
                   Subject: Re: Quick question\r\n\
                   Date: Thu, 6 Aug 2026 10:00:00 +0000\r\n\
                   \r\n\
                   Sounds interesting, tell me more.\r\n";

        let mail = parse_inbound("7", raw).unwrap();
        assert_eq!(mail.uid, "7");
        assert_eq!(mail.message_id, "<reply-1@their.mail>");
        assert_eq!(mail.in_reply_to.as_deref(), Some("<sent-1@our.mail>"));
        assert_eq!(mail.from_address, "jane@their.com");
        assert_eq!(mail.subject, "Re: Quick question");
        assert!(mail.body.contains("tell me more"));
    }

    #[test]
    fn parse_inbound_generates_id_when_missing() {
        let raw = "From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let mail = parse_inbound("3", raw).unwrap();
        assert!(mail.message_id.starts_with("imap-3-"));
        assert!(mail.in_reply_to.is_none());
    }
}
