//! Barcode format validation.
//!
//! Pure and synchronous: this never touches the backend. Whether a well-formed
//! serial actually exists in inventory is checked afterwards, asynchronously.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static SERIAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{9}$").expect("serial pattern is a valid regex")
});

/// `%800006B3-1611180703A`, with or without the leading `%`.
static LEGACY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%?[0-9A-Fa-f]{8}-[0-9]{10}[A-Za-z]?$").expect("legacy pattern is a valid regex")
});

/// Outcome of validating one raw scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarcodeValidation {
    pub is_valid: bool,
    pub error: Option<String>,
    /// The trimmed input, echoed back for operator feedback.
    pub scanned_value: String,
}

impl BarcodeValidation {
    fn valid(scanned_value: String) -> Self {
        Self {
            is_valid: true,
            error: None,
            scanned_value,
        }
    }

    fn invalid(scanned_value: String, error: String) -> Self {
        Self {
            is_valid: false,
            error: Some(error),
            scanned_value,
        }
    }
}

/// Classify a raw scan as a cylinder serial (exactly nine ASCII digits).
pub fn validate_barcode(raw: &str) -> BarcodeValidation {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return BarcodeValidation::invalid(String::new(), "Empty barcode".to_string());
    }

    let scanned = trimmed.to_string();
    if SERIAL_PATTERN.is_match(trimmed) {
        return BarcodeValidation::valid(scanned);
    }

    let error = if is_legacy_barcode(trimmed) {
        format!(
            "Legacy %XXXXXXXX-NNNNNNNNNN barcode is no longer accepted. Expected: exactly 9 digits (e.g., 123456789)\nScanned: {trimmed}"
        )
    } else {
        format!(
            "Invalid cylinder serial number. Expected: exactly 9 digits (e.g., 123456789)\nScanned: {trimmed}"
        )
    };
    BarcodeValidation::invalid(scanned, error)
}

/// Secondary matcher for the retired hex-prefixed label format.
pub fn is_legacy_barcode(value: &str) -> bool {
    LEGACY_PATTERN.is_match(value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nine_digits_are_valid() {
        let result = validate_barcode("123456789");
        assert!(result.is_valid);
        assert_eq!(result.error, None);
        assert_eq!(result.scanned_value, "123456789");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let result = validate_barcode("  987654321\n");
        assert!(result.is_valid);
        assert_eq!(result.scanned_value, "987654321");
    }

    #[test]
    fn empty_and_blank_inputs_are_rejected() {
        for raw in ["", "   ", "\t\n"] {
            let result = validate_barcode(raw);
            assert!(!result.is_valid);
            assert_eq!(result.error.as_deref(), Some("Empty barcode"));
        }
    }

    #[test]
    fn wrong_length_echoes_expected_shape_and_value() {
        let result = validate_barcode("12345678");
        assert!(!result.is_valid);
        let error = result.error.unwrap();
        assert!(error.contains("exactly 9 digits"));
        assert!(error.contains("Scanned: 12345678"));
    }

    #[test]
    fn legacy_format_is_recognised_but_rejected() {
        assert!(is_legacy_barcode("%800006B3-1611180703A"));
        assert!(is_legacy_barcode("800005ca-1579809606"));

        let result = validate_barcode("%800006B3-1611180703A");
        assert!(!result.is_valid);
        assert!(result.error.unwrap().starts_with("Legacy"));
    }

    #[test]
    fn non_ascii_digits_are_rejected() {
        // Arabic-Indic digits are `char::is_numeric` but not ASCII.
        assert!(!validate_barcode("١٢٣٤٥٦٧٨٩").is_valid);
    }

    proptest! {
        #[test]
        fn any_nine_ascii_digits_validate(serial in "[0-9]{9}") {
            let result = validate_barcode(&serial);
            prop_assert!(result.is_valid);
            prop_assert_eq!(result.scanned_value, serial);
        }

        #[test]
        fn other_non_empty_strings_fail_with_an_error(raw in "\\PC{1,24}") {
            let trimmed = raw.trim();
            prop_assume!(!trimmed.is_empty());
            prop_assume!(!(trimmed.len() == 9 && trimmed.bytes().all(|b| b.is_ascii_digit())));

            let result = validate_barcode(&raw);
            prop_assert!(!result.is_valid);
            prop_assert!(result.error.is_some());
        }
    }
}
