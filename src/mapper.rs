//! Normalizes provider vocabularies into a canonical verification status.
//!
//! Both providers speak their own codes. Each is mapped through a fixed
//! lookup table; anything outside the table becomes [`CanonicalStatus::Unknown`]
//! and is logged, never treated as success.

use serde::Serialize;
use std::fmt;

/// Provider-independent verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Accepted,
    Declined,
    Pending,
    Unknown,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Accepted => "accepted",
            CanonicalStatus::Declined => "declined",
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity provider result codes (`res` and `frp` fields).
pub const IDM_ACCEPT: &str = "ACCEPT";
pub const IDM_DENY: &str = "DENY";
pub const IDM_MANUAL_REVIEW: &str = "MANUAL_REVIEW";

/// Identity provider KYC state codes (`state` field).
pub const IDM_STATE_ACCEPTED: &str = "A";
pub const IDM_STATE_DECLINED: &str = "D";
pub const IDM_STATE_REVIEW: &str = "R";

/// Identity provider reputation markers (`user` / `upr` fields).
pub const REPUTATION_TRUSTED: &str = "TRUSTED";
pub const REPUTATION_UNKNOWN: &str = "UNKNOWN";
pub const REPUTATION_SUSPICIOUS: &str = "SUSPICIOUS";
pub const REPUTATION_BAD: &str = "BAD";

const IDM_TABLE: &[(&str, CanonicalStatus)] = &[
    (IDM_ACCEPT, CanonicalStatus::Accepted),
    (IDM_DENY, CanonicalStatus::Declined),
    (IDM_MANUAL_REVIEW, CanonicalStatus::Pending),
    (IDM_STATE_ACCEPTED, CanonicalStatus::Accepted),
    (IDM_STATE_DECLINED, CanonicalStatus::Declined),
    (IDM_STATE_REVIEW, CanonicalStatus::Pending),
];

/// Document provider check statuses.
pub const CHECK_IN_PROGRESS: &str = "in_progress";
pub const CHECK_AWAITING_APPLICANT: &str = "awaiting_applicant";
pub const CHECK_COMPLETE: &str = "complete";
pub const CHECK_WITHDRAWN: &str = "withdrawn";
pub const CHECK_PAUSED: &str = "paused";
pub const CHECK_REOPENED: &str = "reopened";

/// Document provider results.
pub const RESULT_CLEAR: &str = "clear";
pub const RESULT_CONSIDER: &str = "consider";
pub const RESULT_UNIDENTIFIED: &str = "unidentified";

const CHECK_PENDING_STATUSES: &[&str] = &[
    CHECK_IN_PROGRESS,
    CHECK_AWAITING_APPLICANT,
    CHECK_PAUSED,
    CHECK_REOPENED,
];

const CHECK_RESULT_TABLE: &[(&str, CanonicalStatus)] = &[
    (RESULT_CLEAR, CanonicalStatus::Accepted),
    (RESULT_CONSIDER, CanonicalStatus::Declined),
    (RESULT_UNIDENTIFIED, CanonicalStatus::Declined),
];

/// Maps an identity provider code. `None` (no status at all) is `Unknown`.
pub fn normalize_idm(code: Option<&str>) -> CanonicalStatus {
    let Some(code) = code else {
        tracing::warn!("Identity provider response carried no status code");
        return CanonicalStatus::Unknown;
    };

    let trimmed = code.trim();
    match IDM_TABLE
        .iter()
        .find(|(raw, _)| raw.eq_ignore_ascii_case(trimmed))
    {
        Some((_, status)) => *status,
        None => {
            tracing::warn!("Unmapped identity provider status code: {}", code);
            CanonicalStatus::Unknown
        }
    }
}

/// Maps a document provider check. Incomplete checks are pending; complete
/// checks are resolved by their result.
pub fn normalize_check(status: Option<&str>, result: Option<&str>) -> CanonicalStatus {
    match status {
        Some(s) if CHECK_PENDING_STATUSES.contains(&s) => CanonicalStatus::Pending,
        Some(CHECK_COMPLETE) => match result
            .and_then(|r| CHECK_RESULT_TABLE.iter().find(|(raw, _)| *raw == r))
        {
            Some((_, canonical)) => *canonical,
            None => {
                tracing::warn!("Unmapped check result for complete check: {:?}", result);
                CanonicalStatus::Unknown
            }
        },
        other => {
            tracing::warn!("Unmapped check status: {:?}", other);
            CanonicalStatus::Unknown
        }
    }
}

/// Value written to the user's stage result field: the canonical name when
/// the code is mapped, the raw code otherwise.
pub fn stage_result_value(raw: Option<&str>, canonical: CanonicalStatus) -> Option<String> {
    match canonical {
        CanonicalStatus::Unknown => raw.map(str::to_string),
        known => Some(known.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idm_fixture_table() {
        let fixtures = [
            (Some("ACCEPT"), CanonicalStatus::Accepted),
            (Some("accept"), CanonicalStatus::Accepted),
            (Some("DENY"), CanonicalStatus::Declined),
            (Some("MANUAL_REVIEW"), CanonicalStatus::Pending),
            (Some("A"), CanonicalStatus::Accepted),
            (Some("D"), CanonicalStatus::Declined),
            (Some("R"), CanonicalStatus::Pending),
            (Some("SOMETHING_NEW"), CanonicalStatus::Unknown),
            (Some(""), CanonicalStatus::Unknown),
            (None, CanonicalStatus::Unknown),
        ];

        for (code, expected) in fixtures {
            assert_eq!(normalize_idm(code), expected, "code {:?}", code);
        }
    }

    #[test]
    fn test_check_fixture_table() {
        let fixtures = [
            (Some("in_progress"), None, CanonicalStatus::Pending),
            (Some("awaiting_applicant"), None, CanonicalStatus::Pending),
            (Some("reopened"), Some("clear"), CanonicalStatus::Pending),
            (Some("complete"), Some("clear"), CanonicalStatus::Accepted),
            (Some("complete"), Some("consider"), CanonicalStatus::Declined),
            (Some("complete"), Some("unidentified"), CanonicalStatus::Declined),
            (Some("complete"), None, CanonicalStatus::Unknown),
            (Some("withdrawn"), None, CanonicalStatus::Unknown),
            (None, None, CanonicalStatus::Unknown),
        ];

        for (status, result, expected) in fixtures {
            assert_eq!(normalize_check(status, result), expected);
        }
    }

    #[test]
    fn test_stage_result_keeps_raw_signal_when_unknown() {
        assert_eq!(
            stage_result_value(Some("ACCEPT"), CanonicalStatus::Accepted).as_deref(),
            Some("accepted")
        );
        assert_eq!(
            stage_result_value(Some("XYZ"), CanonicalStatus::Unknown).as_deref(),
            Some("XYZ")
        );
        assert_eq!(stage_result_value(None, CanonicalStatus::Unknown), None);
    }
}
