//! Tracking-number validation shared by adapters and the extractor.
//!
//! UPS numbers carry a mod-10 check digit that is verified here; the other
//! carriers publish only structural formats, so those are validated by family
//! and length.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::CarrierCode;

/// Normalize a tracking number: uppercase, strip spaces, dashes, underscores
pub fn normalize(tracking: &str) -> String {
    tracking
        .to_uppercase()
        .replace(' ', "")
        .replace('-', "")
        .replace('_', "")
}

/// Validate a tracking number against one carrier's formats
pub fn validate(carrier: CarrierCode, tracking: &str) -> bool {
    let normalized = normalize(tracking);
    match carrier {
        CarrierCode::Ups => validate_ups(&normalized),
        CarrierCode::Usps => validate_usps(&normalized),
        CarrierCode::Fedex => validate_fedex(&normalized),
        CarrierCode::Dhl => validate_dhl(&normalized),
        CarrierCode::Amazon => validate_amazon(&normalized),
    }
}

/// UPS: `1Z` + 15 alphanumeric + mod-10 check digit.
pub fn validate_ups(tracking: &str) -> bool {
    if tracking.len() != 18 || !tracking.starts_with("1Z") {
        return false;
    }
    let body = &tracking[2..];
    if !body.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    let Some(check) = body.chars().last().and_then(|c| c.to_digit(10)) else {
        return false;
    };

    // Letters map onto digits cyclically starting at 2; even positions
    // (1-based, after the 1Z prefix) are doubled.
    let mut sum: u32 = 0;
    for (i, c) in body[..15].chars().enumerate() {
        let value = match c.to_digit(10) {
            Some(d) => d,
            None => (c as u32 - 'A' as u32 + 2) % 10,
        };
        sum += if i % 2 == 1 { value * 2 } else { value };
    }

    (10 - sum % 10) % 10 == check
}

static USPS_DOMESTIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:9[1-5]\d{18,20}|(?:70|23|03|94|92)\d{14,20})$").unwrap());
static USPS_INTERNATIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}\d{9}US$").unwrap());

/// USPS: 20-22 digit IMpb families (91-95 prefixes and certified/registered
/// 70/23/03 forms) plus the `AA#########US` international format.
pub fn validate_usps(tracking: &str) -> bool {
    if USPS_INTERNATIONAL.is_match(tracking) {
        return true;
    }
    if !(16..=22).contains(&tracking.len()) {
        return false;
    }
    USPS_DOMESTIC.is_match(tracking)
}

/// FedEx: pure digits of the published lengths.
pub fn validate_fedex(tracking: &str) -> bool {
    const LENGTHS: [usize; 6] = [12, 14, 15, 18, 20, 22];
    LENGTHS.contains(&tracking.len()) && tracking.chars().all(|c| c.is_ascii_digit())
}

/// DHL: 10 or 11 digits.
pub fn validate_dhl(tracking: &str) -> bool {
    (tracking.len() == 10 || tracking.len() == 11)
        && tracking.chars().all(|c| c.is_ascii_digit())
}

static AMAZON_ORDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}\d{7}\d{7}$").unwrap());
static AMAZON_LOGISTICS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^TBA\d{12}$").unwrap());

/// Amazon: order numbers (dashes are stripped by normalization) or Amazon
/// Logistics `TBA` numbers.
pub fn validate_amazon(tracking: &str) -> bool {
    AMAZON_ORDER.is_match(tracking) || AMAZON_LOGISTICS.is_match(tracking)
}

/// Whether a raw (pre-normalization) string looks like an Amazon order number
pub fn is_amazon_order_number(raw: &str) -> bool {
    static RAW_ORDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}-\d{7}-\d{7}$").unwrap());
    RAW_ORDER.is_match(raw.trim())
}

/// Carriers whose `validate` accepts the given number
pub fn accepting_carriers(tracking: &str) -> Vec<CarrierCode> {
    [
        CarrierCode::Ups,
        CarrierCode::Usps,
        CarrierCode::Fedex,
        CarrierCode::Dhl,
        CarrierCode::Amazon,
    ]
    .into_iter()
    .filter(|c| validate(*c, tracking))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ups_check_digit() {
        assert!(validate_ups("1Z999AA10123456784"));
        // Same number with a wrong check digit
        assert!(!validate_ups("1Z999AA10123456785"));
        assert!(!validate_ups("1Z999AA1012345678"));
        assert!(!validate_ups("2Z999AA10123456784"));
    }

    #[test]
    fn test_ups_normalization() {
        assert!(validate(CarrierCode::Ups, "1z 999-aa1-0123456784"));
    }

    #[test]
    fn test_usps_families() {
        assert!(validate_usps("9400111899223100000000"));
        assert!(validate_usps("9205511899223100000000"));
        assert!(validate_usps("70140150000012345678"));
        assert!(validate_usps("EC123456789US"));
        assert!(!validate_usps("1234"));
        assert!(!validate_usps("8400111899223100000000"));
    }

    #[test]
    fn test_fedex_lengths() {
        assert!(validate_fedex("123456789012"));
        assert!(validate_fedex("123456789012345678"));
        assert!(validate_fedex("1234567890123456789012"));
        assert!(!validate_fedex("1234567890123"));
        assert!(!validate_fedex("12345678901A"));
    }

    #[test]
    fn test_dhl_lengths() {
        assert!(validate_dhl("1234567890"));
        assert!(validate_dhl("12345678901"));
        assert!(!validate_dhl("123456789"));
        assert!(!validate_dhl("123456789012"));
    }

    #[test]
    fn test_amazon_formats() {
        assert!(validate(CarrierCode::Amazon, "113-1234567-1234567"));
        assert!(validate(CarrierCode::Amazon, "TBA123456789012"));
        assert!(is_amazon_order_number("113-1234567-1234567"));
        assert!(!is_amazon_order_number("TBA123456789012"));
    }

    #[test]
    fn test_accepting_carriers_overlap() {
        // A 20-digit pure-numeric 94-prefixed number is both a USPS IMpb form
        // and a structurally valid FedEx length.
        let accepted = accepting_carriers("9400111899223100000000");
        assert!(accepted.contains(&CarrierCode::Usps));
        assert!(accepted.contains(&CarrierCode::Fedex));
        assert!(!accepted.contains(&CarrierCode::Ups));
    }
}
