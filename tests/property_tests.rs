/// Property-based tests using proptest
/// Tests invariants and properties that should hold for all inputs
use proptest::prelude::*;
use rust_whitelist_api::ledger::{new_transaction_id, parse_response};
use rust_whitelist_api::mapper::{normalize_check, normalize_idm, CanonicalStatus};
use rust_whitelist_api::validation::{is_valid_email, normalize_phone, to_eth, to_telegram};

const MAPPED_IDM_CODES: &[&str] = &["ACCEPT", "DENY", "MANUAL_REVIEW", "A", "D", "R"];

// Property: input normalizers never panic
proptest! {
    #[test]
    fn email_validation_never_panics(email in "\\PC*") {
        let _ = is_valid_email(&email);
    }

    #[test]
    fn eth_parsing_never_panics(value in "\\PC*") {
        let _ = to_eth(&value);
    }

    #[test]
    fn phone_normalization_never_panics(phone in "\\PC*", country in "[A-Za-z]{0,3}") {
        let _ = normalize_phone(&phone, &country);
    }
}

// Property: eth addresses normalize to 40 lower-case hex chars
proptest! {
    #[test]
    fn eth_addresses_normalize(addr in "[0-9a-fA-F]{40}", prefixed in proptest::bool::ANY) {
        let input = if prefixed { format!("0x{}", addr) } else { addr.clone() };
        let normalized = to_eth(&input).unwrap();
        prop_assert_eq!(normalized.len(), 40);
        prop_assert_eq!(normalized, addr.to_ascii_lowercase());
    }

    #[test]
    fn wrong_length_eth_addresses_rejected(addr in "[0-9a-f]{1,39}") {
        prop_assert!(to_eth(&addr).is_err());
    }

    #[test]
    fn telegram_handles_drop_leading_at(name in "[a-zA-Z0-9_]{5,25}") {
        prop_assert_eq!(to_telegram(&format!("@{}", name)).unwrap(), name.clone());
        prop_assert_eq!(to_telegram(&name).unwrap(), name);
    }
}

// Property: unmapped provider codes are never treated as success
proptest! {
    #[test]
    fn unmapped_idm_codes_are_unknown(code in "[A-Za-z_]{0,20}") {
        prop_assume!(!MAPPED_IDM_CODES.iter().any(|c| c.eq_ignore_ascii_case(code.trim())));
        prop_assert_eq!(normalize_idm(Some(&code)), CanonicalStatus::Unknown);
    }

    #[test]
    fn check_result_never_accepted_unless_complete_and_clear(
        status in "[a-z_]{0,20}",
        result in proptest::option::of("[a-z]{0,12}")
    ) {
        let canonical = normalize_check(Some(&status), result.as_deref());
        if canonical == CanonicalStatus::Accepted {
            prop_assert_eq!(status.as_str(), "complete");
            prop_assert_eq!(result.as_deref(), Some("clear"));
        }
    }
}

// Property: response parsing
proptest! {
    #[test]
    fn parse_response_keeps_transaction_id(tid in "[0-9a-f]{1,32}", res in "[A-Z_]{1,12}") {
        let parsed = parse_response(&serde_json::json!({"mtid": tid.clone(), "res": res.clone()})).unwrap();
        prop_assert_eq!(parsed.transaction_id, tid);
        prop_assert_eq!(parsed.result, Some(res));
    }

    #[test]
    fn transaction_ids_are_24_hex(_seed in 0u8..10) {
        let tid = new_transaction_id();
        prop_assert_eq!(tid.len(), 24);
        prop_assert!(tid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
