//! Text classification: what a label, a dialog message, or a whole page says
//! about availability.
//!
//! Pure functions only. The detector feeds them text it read from the page.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Affirmative "apply" wording.
pub const AFFIRMATIVE_KEYWORDS: &[&str] = &["신청", "apply"];

/// Qualifiers meaning "this opens later".
pub const PENDING_KEYWORDS: &[&str] = &["예정", "opens later", "coming soon", "upcoming"];

/// Qualifiers meaning "this is over".
pub const CLOSED_KEYWORDS: &[&str] = &["마감", "종료", "closed"];

/// Server-side throttling language. The numeric code is matched separately on
/// word boundaries.
pub const RATE_LIMIT_PHRASES: &[&str] = &[
    "too many",
    "요청이 많",
    "과도한",
    "잠시 후",
    "rate limit",
];

/// Identifier fragment of challenge widgets.
pub const CHALLENGE_KEYWORD: &str = "captcha";

static RATE_LIMIT_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
static STATUS_429: OnceLock<Regex> = OnceLock::new();

fn rate_limit_matcher() -> &'static AhoCorasick {
    RATE_LIMIT_MATCHER.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(RATE_LIMIT_PHRASES)
            .expect("valid rate-limit phrases")
    })
}

fn status_429() -> &'static Regex {
    STATUS_429.get_or_init(|| Regex::new(r"(^|[^0-9])429([^0-9]|$)").expect("valid 429 pattern"))
}

/// Availability reading of a single control label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    Open,
    Pending,
    Closed,
    Unrelated,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a control label. Both conditions must hold for `Open`: the
/// affirmative keyword is present and no pending/closed qualifier is.
pub fn classify_label(text: &str) -> LabelState {
    let lower = text.to_lowercase();
    let affirmative = contains_any(&lower, AFFIRMATIVE_KEYWORDS);
    if contains_any(&lower, PENDING_KEYWORDS) {
        return if affirmative {
            LabelState::Pending
        } else {
            LabelState::Unrelated
        };
    }
    if contains_any(&lower, CLOSED_KEYWORDS) {
        return if affirmative {
            LabelState::Closed
        } else {
            LabelState::Unrelated
        };
    }
    if affirmative {
        LabelState::Open
    } else {
        LabelState::Unrelated
    }
}

pub fn is_open_label(text: &str) -> bool {
    classify_label(text) == LabelState::Open
}

/// The status-badge rule is stricter: the whole trimmed text must be exactly
/// an affirmative keyword.
pub fn is_exact_open_badge(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    AFFIRMATIVE_KEYWORDS.iter().any(|k| t == *k)
}

pub fn is_rate_limited(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    rate_limit_matcher().is_match(text) || status_429().is_match(text)
}

/// Identifier (`src`, `name`, `id`, `class`) of an element that looks like a
/// challenge widget.
pub fn is_challenge_identifier(ident: &str) -> bool {
    ident.to_lowercase().contains(CHALLENGE_KEYWORD)
}

/// One tick's reading of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    NotAvailable,
    Available,
    RateLimited,
    ChallengePresent,
}

/// Combine independent observations. A challenge beats rate limiting, and both
/// beat availability.
pub fn combine(challenge: bool, rate_limited: bool, available: bool) -> Signal {
    if challenge {
        Signal::ChallengePresent
    } else if rate_limited {
        Signal::RateLimited
    } else if available {
        Signal::Available
    } else {
        Signal::NotAvailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_with_pending_qualifier_never_matches() {
        for text in [
            "신청예정",
            "신청 예정",
            "신청(예정)",
            "Apply - opens later",
            "apply (coming soon)",
            "예정된 신청",
        ] {
            assert!(!is_open_label(text), "{text}");
            assert_eq!(classify_label(text), LabelState::Pending, "{text}");
        }
    }

    #[test]
    fn affirmative_alone_matches() {
        for text in ["신청", "신청 (접수중)", "  신청하기 ", "Apply now"] {
            assert!(is_open_label(text), "{text}");
        }
    }

    #[test]
    fn closed_and_unrelated_labels() {
        assert_eq!(classify_label("신청마감"), LabelState::Closed);
        assert_eq!(classify_label("접수종료 신청"), LabelState::Closed);
        assert_eq!(classify_label("상세보기"), LabelState::Unrelated);
        assert_eq!(classify_label(""), LabelState::Unrelated);
    }

    #[test]
    fn exact_badge_rule() {
        assert!(is_exact_open_badge(" 신청 "));
        assert!(!is_exact_open_badge("신청예정"));
        assert!(!is_exact_open_badge("신청하기"));
    }

    #[test]
    fn rate_limit_language() {
        assert!(is_rate_limited("Too Many Requests"));
        assert!(is_rate_limited("HTTP 429"));
        assert!(is_rate_limited("요청이 많아 잠시 후 다시 시도해 주세요"));
        assert!(is_rate_limited("과도한 접속으로 제한되었습니다"));
        assert!(is_rate_limited("Rate limit exceeded"));
        assert!(!is_rate_limited("신청이 완료되었습니다"));
        assert!(!is_rate_limited("접수번호 14290"));
        assert!(!is_rate_limited(""));
    }

    #[test]
    fn challenge_identifiers_are_case_insensitive() {
        assert!(is_challenge_identifier("/img/CaptchaImage.aspx"));
        assert!(is_challenge_identifier("captcha_answer"));
        assert!(!is_challenge_identifier("userid"));
    }

    #[test]
    fn signal_precedence() {
        assert_eq!(combine(true, true, true), Signal::ChallengePresent);
        assert_eq!(combine(false, true, true), Signal::RateLimited);
        assert_eq!(combine(false, false, true), Signal::Available);
        assert_eq!(combine(false, false, false), Signal::NotAvailable);
    }
}
