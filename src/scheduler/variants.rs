//! Message variant selection and personalization.

use std::collections::HashMap;

use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;

use crate::model::{Lead, SequenceStep, Variant};

/// Rendered subject/body pair ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Pick a variant by weighted random draw over the step's enabled
/// variants. Returns `None` when nothing is enabled or all weights are
/// zero — callers fall back to the step's legacy subject/body.
///
/// The draw walks cumulative weights in variant position order, so on
/// equal weights ties resolve to the earliest variant whose bucket
/// contains the draw.
pub fn pick_variant<'a, R: Rng>(variants: &'a [Variant], rng: &mut R) -> Option<&'a Variant> {
    let enabled: Vec<&Variant> = variants.iter().filter(|v| v.enabled).collect();
    let total: u32 = enabled.iter().map(|v| v.weight).sum();
    if total == 0 {
        return None;
    }

    let draw = rng.gen_range(0..total);
    let mut bound = 0;
    for variant in enabled {
        bound += variant.weight;
        if draw < bound {
            return Some(variant);
        }
    }
    None
}

/// Render the message for a step: weighted variant if one is enabled,
/// otherwise the step's legacy subject/body, with personalization tokens
/// interpolated from the lead.
pub fn render_message<R: Rng>(step: &SequenceStep, lead: &Lead, rng: &mut R) -> RenderedMessage {
    let (subject, body) = match pick_variant(&step.variants, rng) {
        Some(variant) => (variant.subject.as_str(), variant.body.as_str()),
        None => (step.subject.as_str(), step.body.as_str()),
    };

    RenderedMessage {
        subject: interpolate(subject, lead),
        body: interpolate(body, lead),
    }
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Replace `{{token}}` placeholders with lead fields. Unknown tokens
/// become empty strings — one bad lead must never abort a cycle.
pub fn interpolate(template: &str, lead: &Lead) -> String {
    TOKEN_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup_token(&caps[1], lead).unwrap_or_default()
        })
        .into_owned()
}

fn lookup_token(token: &str, lead: &Lead) -> Option<String> {
    match token {
        "first_name" => Some(lead.first_name.clone()),
        "last_name" => Some(lead.last_name.clone()),
        "company" => Some(lead.company.clone()),
        "email" => Some(lead.email.clone()),
        _ => lead.custom_fields.get(token).cloned(),
    }
}

/// Build the custom-field map lookup used by imports (public so import
/// plumbing can validate templates against a lead's fields).
pub fn known_tokens(lead: &Lead) -> Vec<String> {
    let mut tokens = vec![
        "first_name".to_string(),
        "last_name".to_string(),
        "company".to_string(),
        "email".to_string(),
    ];
    tokens.extend(lead.custom_fields.keys().cloned());
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use uuid::Uuid;

    fn lead() -> Lead {
        let mut lead = Lead::new(Uuid::new_v4(), "jane@acme.com");
        lead.first_name = "Jane".to_string();
        lead.company = "Acme".to_string();
        lead.custom_fields =
            HashMap::from([("role".to_string(), "CTO".to_string())]);
        lead
    }

    fn variant(weight: u32, enabled: bool, subject: &str) -> Variant {
        let mut v = Variant::new(Uuid::new_v4(), subject, "body", weight);
        v.enabled = enabled;
        v
    }

    #[test]
    fn interpolate_known_and_custom_tokens() {
        let out = interpolate("Hi {{first_name}} ({{ role }}) at {{company}}", &lead());
        assert_eq!(out, "Hi Jane (CTO) at Acme");
    }

    #[test]
    fn interpolate_unknown_token_becomes_empty() {
        let out = interpolate("Hello {{nickname}}!", &lead());
        assert_eq!(out, "Hello !");
    }

    #[test]
    fn disabled_variants_are_never_drawn() {
        let variants = vec![variant(100, false, "off"), variant(1, true, "on")];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(pick_variant(&variants, &mut rng).unwrap().subject, "on");
        }
    }

    #[test]
    fn no_enabled_variants_yields_none() {
        let variants = vec![variant(50, false, "a"), variant(50, false, "b")];
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pick_variant(&variants, &mut rng).is_none());
        assert!(pick_variant(&[], &mut rng).is_none());
    }

    #[test]
    fn zero_total_weight_yields_none() {
        let variants = vec![variant(0, true, "a"), variant(0, true, "b")];
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pick_variant(&variants, &mut rng).is_none());
    }

    #[test]
    fn draw_respects_weights_roughly() {
        let variants = vec![variant(90, true, "heavy"), variant(10, true, "light")];
        let mut rng = StdRng::seed_from_u64(42);
        let heavy = (0..1000)
            .filter(|_| pick_variant(&variants, &mut rng).unwrap().subject == "heavy")
            .count();
        // 90/10 split; allow generous slack, the point is the skew.
        assert!(heavy > 800, "heavy drawn {heavy}/1000");
    }

    #[test]
    fn equal_weights_split_roughly_evenly() {
        let variants = vec![variant(50, true, "a"), variant(50, true, "b")];
        let mut rng = StdRng::seed_from_u64(42);
        let first = (0..1000)
            .filter(|_| pick_variant(&variants, &mut rng).unwrap().subject == "a")
            .count();
        assert!((350..=650).contains(&first), "a drawn {first}/1000");
    }

    #[test]
    fn render_falls_back_to_step_copy() {
        let campaign = Uuid::new_v4();
        let mut step = SequenceStep::new(campaign, 1, "Hi {{first_name}}", "From the step");
        step.variants = vec![variant(100, false, "never")];
        let mut rng = StdRng::seed_from_u64(1);

        let rendered = render_message(&step, &lead(), &mut rng);
        assert_eq!(rendered.subject, "Hi Jane");
        assert_eq!(rendered.body, "From the step");
    }
}
