//! Deterministic regex extraction: carrier hints plus per-carrier tracking
//! number patterns with context-aware confidence.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::CarrierCode;

use super::preprocess::EmailContent;
use super::{Candidate, CandidateSource};

/// How far back to look for a "tracking number:"-style label
const CONTEXT_WINDOW: usize = 80;

const CONTEXT_BOOST: f64 = 0.25;
const HINT_BOOST: f64 = 0.15;

/// Hint strengths
const SENDER_HINT: f64 = 0.9;
const SUBJECT_HINT: f64 = 0.5;
const BODY_HINT: f64 = 0.2;

struct CarrierPattern {
    carrier: CarrierCode,
    regex: &'static Lazy<Regex>,
    base_confidence: f64,
}

static UPS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b1Z[0-9A-Z]{16}\b").unwrap());
static USPS_IMPB: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b9[1-5]\d{19,20}\b").unwrap());
static USPS_CERTIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:70|23|03)\d{14,18}\b").unwrap());
static USPS_INTL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2}\d{9}US\b").unwrap());
static FEDEX_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{12}\b").unwrap());
static FEDEX_MID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{14,15}\b").unwrap());
static FEDEX_LONG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{18}\b").unwrap());
static FEDEX_SMART: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{20}\b|\b\d{22}\b").unwrap());
static DHL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{10,11}\b").unwrap());
static AMAZON_ORDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{7}-\d{7}\b").unwrap());
static AMAZON_LOGISTICS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTBA\d{12}\b").unwrap());

static TRACKING_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(tracking\s*(number|no\.?|#|id)?\s*[:\-]?|track\s+your\s+(package|order|shipment))")
        .unwrap()
});

/// Patterns in deterministic evaluation order: specific formats before the
/// ambiguous pure-digit families.
static PATTERNS: Lazy<Vec<CarrierPattern>> = Lazy::new(|| {
    vec![
        CarrierPattern { carrier: CarrierCode::Ups, regex: &UPS_PATTERN, base_confidence: 0.9 },
        CarrierPattern { carrier: CarrierCode::Amazon, regex: &AMAZON_LOGISTICS, base_confidence: 0.9 },
        CarrierPattern { carrier: CarrierCode::Amazon, regex: &AMAZON_ORDER, base_confidence: 0.95 },
        CarrierPattern { carrier: CarrierCode::Usps, regex: &USPS_IMPB, base_confidence: 0.8 },
        CarrierPattern { carrier: CarrierCode::Usps, regex: &USPS_CERTIFIED, base_confidence: 0.7 },
        CarrierPattern { carrier: CarrierCode::Usps, regex: &USPS_INTL, base_confidence: 0.85 },
        CarrierPattern { carrier: CarrierCode::Fedex, regex: &FEDEX_SHORT, base_confidence: 0.5 },
        CarrierPattern { carrier: CarrierCode::Fedex, regex: &FEDEX_MID, base_confidence: 0.5 },
        CarrierPattern { carrier: CarrierCode::Fedex, regex: &FEDEX_LONG, base_confidence: 0.5 },
        CarrierPattern { carrier: CarrierCode::Fedex, regex: &FEDEX_SMART, base_confidence: 0.4 },
        // Bare 10-11 digit runs are weak evidence without a label nearby
        CarrierPattern { carrier: CarrierCode::Dhl, regex: &DHL_PATTERN, base_confidence: 0.3 },
    ]
});

static SENDER_DOMAINS: Lazy<HashMap<&'static str, CarrierCode>> = Lazy::new(|| {
    HashMap::from([
        ("ups.com", CarrierCode::Ups),
        ("usps.com", CarrierCode::Usps),
        ("usps.gov", CarrierCode::Usps),
        ("fedex.com", CarrierCode::Fedex),
        ("dhl.com", CarrierCode::Dhl),
        ("dhl.de", CarrierCode::Dhl),
        ("amazon.com", CarrierCode::Amazon),
    ])
});

static MERCHANT_DOMAINS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("amazon.com", "Amazon"),
        ("ebay.com", "eBay"),
        ("etsy.com", "Etsy"),
        ("walmart.com", "Walmart"),
        ("target.com", "Target"),
        ("bestbuy.com", "Best Buy"),
        ("newegg.com", "Newegg"),
        ("aliexpress.com", "AliExpress"),
        ("shopify.com", "Shopify"),
    ])
});

/// Carrier likelihood per message: sender domain is strong evidence, subject
/// keywords medium, body keywords weak. Hints may coexist.
pub fn carrier_hints(content: &EmailContent, body: &str) -> HashMap<CarrierCode, f64> {
    let mut hints: HashMap<CarrierCode, f64> = HashMap::new();
    let mut bump = |carrier: CarrierCode, score: f64| {
        let entry = hints.entry(carrier).or_insert(0.0);
        *entry = entry.max(score);
    };

    if let Some(domain) = content.sender_domain() {
        let domain = domain.to_lowercase();
        for (known, carrier) in SENDER_DOMAINS.iter() {
            if domain == *known || domain.ends_with(&format!(".{}", known)) {
                bump(*carrier, SENDER_HINT);
            }
        }
    }

    let subject = content.subject.to_lowercase();
    let body_lower = body.to_lowercase();
    for (keyword, carrier) in [
        ("ups", CarrierCode::Ups),
        ("usps", CarrierCode::Usps),
        ("postal service", CarrierCode::Usps),
        ("fedex", CarrierCode::Fedex),
        ("dhl", CarrierCode::Dhl),
        ("amazon", CarrierCode::Amazon),
    ] {
        if subject.contains(keyword) {
            bump(carrier, SUBJECT_HINT);
        }
        if body_lower.contains(keyword) {
            bump(carrier, BODY_HINT);
        }
    }

    hints
}

/// Merchant name derived from the sender domain, when recognized.
pub fn merchant_hint(content: &EmailContent) -> Option<String> {
    let domain = content.sender_domain()?.to_lowercase();
    for (known, name) in MERCHANT_DOMAINS.iter() {
        if domain == *known || domain.ends_with(&format!(".{}", known)) {
            return Some((*name).to_string());
        }
    }
    // Fall back to the second-level label, capitalized
    let label = domain.split('.').rev().nth(1)?;
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Run every carrier pattern over the text. Deterministic: candidates come
/// out in pattern order, then match order, then get a stable final sort.
pub fn extract(
    text: &str,
    hints: &HashMap<CarrierCode, f64>,
    merchant: Option<&str>,
) -> Vec<Candidate> {
    let mut seen: HashMap<(String, CarrierCode), usize> = HashMap::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for pattern in PATTERNS.iter() {
        for found in pattern.regex.find_iter(text) {
            let number = found.as_str().to_string();
            let mut confidence = pattern.base_confidence;

            if has_tracking_label_before(text, found.start()) {
                confidence += CONTEXT_BOOST;
            }
            if hints.get(&pattern.carrier).copied().unwrap_or(0.0) >= SUBJECT_HINT {
                confidence += HINT_BOOST;
            }
            let confidence = confidence.min(1.0);

            let key = (number.clone(), pattern.carrier);
            match seen.get(&key) {
                Some(&index) => {
                    if confidence > candidates[index].confidence {
                        candidates[index].confidence = confidence;
                    }
                }
                None => {
                    seen.insert(key, candidates.len());
                    candidates.push(Candidate {
                        tracking_number: number,
                        carrier: pattern.carrier,
                        description: None,
                        merchant: merchant.map(str::to_string),
                        confidence,
                        source: CandidateSource::Regex,
                    });
                }
            }
        }
    }

    sort_candidates(&mut candidates);
    candidates
}

/// Stable deterministic ordering: strongest first, ties broken by number
/// then carrier code.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tracking_number.cmp(&b.tracking_number))
            .then_with(|| a.carrier.as_str().cmp(b.carrier.as_str()))
    });
}

fn has_tracking_label_before(text: &str, match_start: usize) -> bool {
    let window_start = match_start.saturating_sub(CONTEXT_WINDOW);
    // Clamp to char boundaries
    let mut start = window_start;
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    TRACKING_LABEL.is_match(&text[start..match_start])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amazon_content() -> EmailContent {
        EmailContent {
            from_address: "ship-confirm@amazon.com".into(),
            subject: "Your Amazon.com order has shipped".into(),
            body_text: None,
            body_html: None,
        }
    }

    #[test]
    fn test_ups_and_order_number_extracted() {
        let text = "Order 113-1234567-1234567 shipped. UPS tracking 1Z999AA10123456784";
        let hints = carrier_hints(&amazon_content(), text);
        let candidates = extract(text, &hints, Some("Amazon"));

        let numbers: Vec<&str> = candidates.iter().map(|c| c.tracking_number.as_str()).collect();
        assert!(numbers.contains(&"1Z999AA10123456784"));
        assert!(numbers.contains(&"113-1234567-1234567"));
    }

    #[test]
    fn test_context_label_raises_confidence() {
        let hints = HashMap::new();
        let labeled = extract("Tracking number: 1Z999AA10123456784", &hints, None);
        let bare = extract("ref 1Z999AA10123456784", &hints, None);
        assert!(labeled[0].confidence > bare[0].confidence);
    }

    #[test]
    fn test_dhl_needs_label_for_confidence() {
        let hints = HashMap::new();
        let bare = extract("invoice 1234567890", &hints, None);
        assert_eq!(bare[0].carrier, CarrierCode::Dhl);
        assert!(bare[0].confidence < 0.5);

        let labeled = extract("DHL tracking number: 1234567890", &hints, None);
        assert!(labeled[0].confidence > bare[0].confidence);
    }

    #[test]
    fn test_sender_domain_is_strong_hint() {
        let content = amazon_content();
        let hints = carrier_hints(&content, "");
        assert_eq!(hints.get(&CarrierCode::Amazon), Some(&SENDER_HINT));
    }

    #[test]
    fn test_subject_hint_is_medium() {
        let content = EmailContent {
            from_address: "noreply@shop.example".into(),
            subject: "Your FedEx package is on its way".into(),
            body_text: None,
            body_html: None,
        };
        let hints = carrier_hints(&content, "");
        assert_eq!(hints.get(&CarrierCode::Fedex), Some(&SUBJECT_HINT));
    }

    #[test]
    fn test_merchant_hint() {
        assert_eq!(merchant_hint(&amazon_content()).as_deref(), Some("Amazon"));

        let unknown = EmailContent {
            from_address: "orders@coolgadgets.io".into(),
            ..Default::default()
        };
        assert_eq!(merchant_hint(&unknown).as_deref(), Some("Coolgadgets"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let text = "numbers: 1Z999AA10123456784, 9400111899223100000000, 1234567890";
        let hints = HashMap::new();
        let first = extract(text, &hints, None);
        let second = extract(text, &hints, None);
        let as_pairs = |cs: &[Candidate]| {
            cs.iter()
                .map(|c| (c.tracking_number.clone(), c.carrier, c.confidence))
                .collect::<Vec<_>>()
        };
        assert_eq!(as_pairs(&first), as_pairs(&second));
    }

    #[test]
    fn test_twenty_two_digit_run_matches_usps_and_fedex() {
        let text = "9400111899223100000000";
        let hints = HashMap::new();
        let candidates = extract(text, &hints, None);
        let carriers: Vec<CarrierCode> = candidates.iter().map(|c| c.carrier).collect();
        assert!(carriers.contains(&CarrierCode::Usps));
        assert!(carriers.contains(&CarrierCode::Fedex));
    }
}
