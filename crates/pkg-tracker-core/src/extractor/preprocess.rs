//! Email preprocessing: HTML reduction, whitespace normalization, footer
//! stripping. The output feeds both the regex and LLM extraction paths and
//! must be deterministic.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::carriers::scrape::html_to_text;

static FOOTER_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)^--\s*$",
        r"(?im)^unsubscribe\b",
        r"(?im)^sent from my \w+",
        r"(?im)^this email was sent to\b",
        r"(?im)^if you no longer wish to receive\b",
        r"(?im)^view (this email )?in (your )?browser\b",
        r"(?im)^privacy (policy|statement)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// A decoded email ready for extraction.
#[derive(Debug, Clone, Default)]
pub struct EmailContent {
    pub from_address: String,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

impl EmailContent {
    /// The text the extractor operates on: the plain part when present,
    /// otherwise the HTML part reduced to text.
    pub fn effective_text(&self) -> String {
        match (&self.body_text, &self.body_html) {
            (Some(text), _) if !text.trim().is_empty() => normalize(text),
            (_, Some(html)) => normalize(&html_to_text(html)),
            _ => String::new(),
        }
    }

    /// Rough size/complexity signal used to decide whether the LLM path is
    /// worth invoking for this message.
    pub fn is_complex(&self) -> bool {
        self.body_html.as_deref().map(|h| h.len() > 50_000).unwrap_or(false)
    }

    pub fn sender_domain(&self) -> Option<&str> {
        self.from_address
            .rsplit('@')
            .next()
            .map(|d| d.trim_end_matches('>').trim())
            .filter(|d| !d.is_empty() && d.contains('.'))
    }
}

/// Normalize whitespace and drop everything below the first footer marker.
pub fn normalize(text: &str) -> String {
    let mut cut = text.len();
    for marker in FOOTER_MARKERS.iter() {
        if let Some(found) = marker.find(text) {
            cut = cut.min(found.start());
        }
    }
    let head = &text[..cut];

    let cleaned: Vec<String> = head
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect();
    let joined = cleaned.join("\n");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_text_part() {
        let content = EmailContent {
            body_text: Some("tracking 1Z999AA10123456784".into()),
            body_html: Some("<b>something else</b>".into()),
            ..Default::default()
        };
        assert!(content.effective_text().contains("1Z999AA10123456784"));
    }

    #[test]
    fn test_html_fallback_reduces_to_text() {
        let content = EmailContent {
            body_text: None,
            body_html: Some("<table><tr><td>Tracking</td><td>1Z999AA10123456784</td></tr></table>".into()),
            ..Default::default()
        };
        let text = content.effective_text();
        assert!(text.contains("1Z999AA10123456784"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_footer_stripped() {
        let text = "Your order shipped.\nTracking: 1Z999AA10123456784\n\nUnsubscribe here\nboring legal text";
        let normalized = normalize(text);
        assert!(normalized.contains("1Z999AA10123456784"));
        assert!(!normalized.contains("legal text"));
    }

    #[test]
    fn test_blank_runs_collapsed() {
        let normalized = normalize("a\n\n\n\n\nb");
        assert_eq!(normalized, "a\n\nb");
    }

    #[test]
    fn test_sender_domain() {
        let content = EmailContent {
            from_address: "Amazon <ship-confirm@amazon.com>".into(),
            ..Default::default()
        };
        assert_eq!(content.sender_domain(), Some("amazon.com"));
    }

    #[test]
    fn test_determinism() {
        let content = EmailContent {
            body_html: Some("<div>Tracking 1Z999AA10123456784</div>".into()),
            ..Default::default()
        };
        assert_eq!(content.effective_text(), content.effective_text());
    }
}
