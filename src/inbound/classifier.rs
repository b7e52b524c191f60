//! Inbound message classification.
//!
//! The reconciler treats classification as a black box behind the
//! `ReplyClassifier` trait; the shipped implementation is a compiled
//! regex rule set. Ambiguous messages come back as `Other`, which the
//! reconciler records but does not act on.

use regex::Regex;

/// Closed classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Delivery failure notification.
    Bounce,
    /// Out-of-office / auto-generated response.
    AutoReply,
    /// A genuine human reply.
    Reply,
    /// Unattributable or ambiguous; recorded for manual inspection.
    Other,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounce => write!(f, "bounce"),
            Self::AutoReply => write!(f, "auto_reply"),
            Self::Reply => write!(f, "reply"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Pluggable classifier seam; rule-based here, swappable for a model.
pub trait ReplyClassifier: Send + Sync {
    fn classify(&self, sender: &str, subject: &str, body: &str) -> Classification;
}

/// A compiled classification rule.
struct Rule {
    regex: Regex,
    field: Field,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Sender,
    Subject,
    Body,
}

impl Rule {
    fn matches(&self, sender: &str, subject: &str, body: &str) -> bool {
        match self.field {
            Field::Sender => self.regex.is_match(sender),
            Field::Subject => self.regex.is_match(subject),
            Field::Body => self.regex.is_match(body),
        }
    }
}

/// Regex-based classifier. The rule set doubles as the bounce/auto-reply
/// grammar specification, pinned by the fixture tests below.
pub struct RuleBasedClassifier {
    bounce_rules: Vec<Rule>,
    auto_reply_rules: Vec<Rule>,
    /// A reply is only recognized when it has some substance.
    min_reply_chars: usize,
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBasedClassifier {
    pub fn new() -> Self {
        let bounce_rules = vec![
            Rule {
                regex: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@").unwrap(),
                field: Field::Sender,
            },
            Rule {
                regex: Regex::new(
                    r"(?i)(delivery (status notification|failure)|undeliverable|returned mail|failure notice|mail delivery failed)",
                )
                .unwrap(),
                field: Field::Subject,
            },
            Rule {
                regex: Regex::new(
                    r"(?i)((550|551|553|554) |user unknown|mailbox (unavailable|full|not found)|address rejected|does not exist|permanent (error|failure))",
                )
                .unwrap(),
                field: Field::Body,
            },
        ];

        let auto_reply_rules = vec![
            Rule {
                regex: Regex::new(
                    r"(?i)(out of (the )?office|automatic reply|auto[\-_ ]?reply|autoreply|away from (my )?email)",
                )
                .unwrap(),
                field: Field::Subject,
            },
            Rule {
                regex: Regex::new(
                    r"(?i)(i('| a)m (currently )?(out of|away from) (the )?office|on (annual|parental) leave|limited access to (my )?email|will (respond|reply) (to your (message|email) )?(when i return|upon my return)|auto-submitted)",
                )
                .unwrap(),
                field: Field::Body,
            },
        ];

        Self {
            bounce_rules,
            auto_reply_rules,
            min_reply_chars: 2,
        }
    }
}

impl ReplyClassifier for RuleBasedClassifier {
    fn classify(&self, sender: &str, subject: &str, body: &str) -> Classification {
        if self
            .bounce_rules
            .iter()
            .any(|r| r.matches(sender, subject, body))
        {
            return Classification::Bounce;
        }

        if self
            .auto_reply_rules
            .iter()
            .any(|r| r.matches(sender, subject, body))
        {
            return Classification::AutoReply;
        }

        if body.trim().len() >= self.min_reply_chars {
            Classification::Reply
        } else {
            Classification::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RuleBasedClassifier {
        RuleBasedClassifier::new()
    }

    // ── Bounce fixtures ─────────────────────────────────────────────

    #[test]
    fn mailer_daemon_sender_is_a_bounce() {
        let c = classifier().classify(
            "mailer-daemon@googlemail.com",
            "Delivery Status Notification (Failure)",
            "The email account that you tried to reach does not exist.",
        );
        assert_eq!(c, Classification::Bounce);
    }

    #[test]
    fn undeliverable_subject_is_a_bounce() {
        let c = classifier().classify(
            "noreply@mail.example.com",
            "Undeliverable: Quick question",
            "",
        );
        assert_eq!(c, Classification::Bounce);
    }

    #[test]
    fn smtp_550_body_is_a_bounce() {
        let c = classifier().classify(
            "postmaster@corp.com",
            "Returned mail",
            "550 5.1.1 user unknown",
        );
        assert_eq!(c, Classification::Bounce);
    }

    // ── Auto-reply fixtures ─────────────────────────────────────────

    #[test]
    fn out_of_office_subject_is_auto_reply() {
        let c = classifier().classify(
            "jane@acme.com",
            "Out of Office: Re: Quick question",
            "I will be back Monday.",
        );
        assert_eq!(c, Classification::AutoReply);
    }

    #[test]
    fn automatic_reply_subject_is_auto_reply() {
        let c = classifier().classify(
            "jane@acme.com",
            "Automatic reply: Quick question",
            "Thanks for your email.",
        );
        assert_eq!(c, Classification::AutoReply);
    }

    #[test]
    fn ooo_body_is_auto_reply() {
        let c = classifier().classify(
            "jane@acme.com",
            "Re: Quick question",
            "I'm currently out of office with limited access to my email.",
        );
        assert_eq!(c, Classification::AutoReply);
    }

    // ── Reply / other fixtures ──────────────────────────────────────

    #[test]
    fn substantive_message_is_a_reply() {
        let c = classifier().classify(
            "jane@acme.com",
            "Re: Quick question",
            "Interesting — can you send pricing?",
        );
        assert_eq!(c, Classification::Reply);
    }

    #[test]
    fn empty_body_is_other() {
        let c = classifier().classify("jane@acme.com", "Re: Quick question", "  ");
        assert_eq!(c, Classification::Other);
    }

    #[test]
    fn bounce_wins_over_auto_reply_wording() {
        // A bounce report quoting an OOO body is still a bounce.
        let c = classifier().classify(
            "mailer-daemon@corp.com",
            "Mail delivery failed",
            "The original message said: out of office",
        );
        assert_eq!(c, Classification::Bounce);
    }
}
