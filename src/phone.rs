//! Phone number canonicalization for the messaging API.
//!
//! This is a heuristic, not an E.164 validator: anything it does not
//! recognize is assumed to be a domestic number and gets the default
//! country code.
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::debug;

use crate::config;

static DOMESTIC_MOBILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^3\d{9}$").expect("valid domestic mobile pattern"));

/// A number in `+<countrycode><number>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn as_international(&self) -> &str {
        &self.0
    }

    /// Digits only, as the messaging API expects them.
    pub fn for_api(&self) -> &str {
        self.0.strip_prefix('+').unwrap_or(&self.0)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNormalizer {
    default_country_code: String,
    known_country_codes: Vec<String>,
}

impl PhoneNormalizer {
    pub fn new(default_country_code: impl Into<String>, known_country_codes: Vec<String>) -> Self {
        Self {
            default_country_code: default_country_code.into(),
            known_country_codes,
        }
    }

    pub fn from_config(cfg: &config::Phone) -> Self {
        Self::new(
            cfg.default_country_code.trim(),
            cfg.known_country_codes.clone(),
        )
    }

    pub fn normalize(&self, raw: &str) -> PhoneNumber {
        let cleaned = strip_to_dialable(raw);
        if cleaned.starts_with('+') {
            return PhoneNumber(cleaned);
        }

        if cleaned.len() > 10
            && self
                .known_country_codes
                .iter()
                .any(|cc| cleaned.starts_with(cc.as_str()))
        {
            return PhoneNumber(format!("+{cleaned}"));
        }

        // Domestic mobile, exact 10 digits, and anything shorter all take the
        // default country code.
        if !DOMESTIC_MOBILE.is_match(&cleaned) {
            debug!(digits = cleaned.len(), "not a domestic mobile; assuming default country code");
        }
        PhoneNumber(format!("+{}{}", self.default_country_code, cleaned))
    }

    /// True when the raw input is a domestic mobile number.
    pub fn is_domestic_mobile(&self, raw: &str) -> bool {
        DOMESTIC_MOBILE.is_match(&strip_to_dialable(raw))
    }
}

/// Keep digits plus a single leading `+`.
fn strip_to_dialable(raw: &str) -> String {
    let trimmed = raw.trim_start();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(char::is_ascii_digit));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> PhoneNormalizer {
        PhoneNormalizer::new("57", vec!["1".into(), "34".into(), "57".into(), "593".into()])
    }

    #[test]
    fn plus_prefixed_is_unchanged() {
        let n = normalizer();
        for raw in ["+573001234567", "+14155550100", "+34600111222", "+5"] {
            assert_eq!(n.normalize(raw).as_international(), raw);
        }
    }

    #[test]
    fn domestic_mobile_gets_default_code_once() {
        let n = normalizer();
        let first = n.normalize("3001234567");
        assert_eq!(first.as_international(), "+573001234567");
        assert_eq!(first.for_api(), "573001234567");
        let again = n.normalize(first.as_international());
        assert_eq!(again, first);
    }

    #[test]
    fn formatting_characters_are_stripped() {
        let n = normalizer();
        assert_eq!(
            n.normalize("(300) 123-4567").as_international(),
            "+573001234567"
        );
        assert_eq!(
            n.normalize(" +57 300 123 4567 ").as_international(),
            "+573001234567"
        );
        // only a leading plus survives
        assert_eq!(n.normalize("300+1234567").as_international(), "+573001234567");
    }

    #[test]
    fn long_number_with_known_prefix_gets_plus() {
        let n = normalizer();
        assert_eq!(n.normalize("573001234567").as_international(), "+573001234567");
        assert_eq!(n.normalize("593991234567").as_international(), "+593991234567");
    }

    #[test]
    fn short_and_unknown_fall_back_to_default() {
        let n = normalizer();
        assert_eq!(n.normalize("6041234").as_international(), "+576041234");
        assert_eq!(n.normalize("99123456789").as_international(), "+5799123456789");
        // ten-digit foreign numbers are treated as domestic
        assert_eq!(n.normalize("4155550100").as_international(), "+574155550100");
    }

    #[test]
    fn domestic_mobile_detection() {
        let n = normalizer();
        assert!(n.is_domestic_mobile("300 123 4567"));
        assert!(!n.is_domestic_mobile("6041234567"));
        assert!(!n.is_domestic_mobile("+573001234567"));
    }
}
