//! Availability detector: turns the current page into one [`Signal`] and at
//! most one chosen [`Control`].
//!
//! Search tiers, highest priority first:
//! 1. anchors/buttons/inputs inside a `btn-grp` container,
//! 2. unscoped anchors, then buttons, then button-like inputs,
//! 3. `span.status` badges reading exactly the affirmative keyword, resolved to
//!    the nearest clickable ancestor within [`ANCESTOR_CLIMB`] levels.
//!
//! Within a pattern, document order decides. The first displayed candidate
//! that passes the label rule wins and nothing after it is looked at.

use serde::Serialize;
use tracing::debug;

use super::signals::{self, Signal};
use crate::browser::{Control, DomProvider, Pattern};
use crate::core::error::{DomError, DomResult};

pub const BUTTON_GROUP_CLASS: &str = "btn-grp";
pub const STATUS_CLASS: &str = "status";
pub const ANCESTOR_CLIMB: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ButtonGroup,
    Unscoped,
    StatusBadge,
}

fn button_inputs() -> Pattern {
    Pattern::tags(&["input"]).input_types(&["button", "submit"])
}

/// Ordered `(tier, pattern)` table the detector walks.
pub fn search_plan() -> Vec<(Tier, Pattern)> {
    vec![
        (
            Tier::ButtonGroup,
            Pattern::tags(&["a", "button"]).within_class(BUTTON_GROUP_CLASS),
        ),
        (Tier::ButtonGroup, button_inputs().within_class(BUTTON_GROUP_CLASS)),
        (Tier::Unscoped, Pattern::tags(&["a"])),
        (Tier::Unscoped, Pattern::tags(&["button"])),
        (Tier::Unscoped, button_inputs()),
        (
            Tier::StatusBadge,
            Pattern::tags(&["span"]).class_contains(STATUS_CLASS),
        ),
    ]
}

/// Structural markers of a challenge widget. Presence alone counts, displayed
/// or not.
pub fn challenge_patterns() -> Vec<Pattern> {
    vec![
        Pattern::tags(&["iframe"]).attr_contains("src", "recaptcha"),
        Pattern::default().attr_contains("id", "recaptcha"),
        Pattern::default().attr_contains("class", "recaptcha"),
        Pattern::tags(&["img"]).attr_contains("src", signals::CHALLENGE_KEYWORD),
        Pattern::tags(&["input"]).attr_contains("name", signals::CHALLENGE_KEYWORD),
    ]
}

/// The detector's reading of one tick.
#[derive(Debug, Clone)]
pub struct Scan {
    pub signal: Signal,
    pub control: Option<Control>,
    pub tier: Option<Tier>,
}

/// Provider faults on a single candidate skip the candidate; a disconnect
/// still ends the scan.
fn skip_candidate(err: DomError) -> DomResult<()> {
    if err.is_disconnect() {
        return Err(err);
    }
    debug!("detector: candidate skipped: {}", err);
    Ok(())
}

async fn nearest_clickable<D: DomProvider + ?Sized>(
    dom: &mut D,
    start: &Control,
) -> DomResult<Option<Control>> {
    if start.is_clickable() {
        return Ok(Some(start.clone()));
    }
    let mut cur = start.clone();
    for _ in 0..ANCESTOR_CLIMB {
        match dom.parent(&cur).await? {
            Some(p) if p.is_clickable() => return Ok(Some(p)),
            Some(p) => cur = p,
            None => break,
        }
    }
    Ok(None)
}

/// First displayed control in an open state, with the tier it came from.
pub async fn find_apply_control<D: DomProvider + ?Sized>(
    dom: &mut D,
) -> DomResult<Option<(Tier, Control)>> {
    for (tier, pattern) in search_plan() {
        let candidates = match dom.query(&pattern).await {
            Ok(c) => c,
            Err(e) => {
                skip_candidate(e)?;
                continue;
            }
        };
        for c in candidates {
            let label_ok = match tier {
                Tier::StatusBadge => signals::is_exact_open_badge(&c.text),
                _ => signals::is_open_label(&c.text),
            };
            if !label_ok {
                continue;
            }
            match dom.is_displayed(&c).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    skip_candidate(e)?;
                    continue;
                }
            }
            let chosen = match tier {
                Tier::StatusBadge => match nearest_clickable(dom, &c).await {
                    Ok(found) => found,
                    Err(e) => {
                        skip_candidate(e)?;
                        None
                    }
                },
                _ => Some(c),
            };
            if let Some(control) = chosen {
                debug!("detector: {:?} match {:?}", tier, control.text);
                return Ok(Some((tier, control)));
            }
        }
    }
    Ok(None)
}

pub async fn detect_challenge<D: DomProvider + ?Sized>(dom: &mut D) -> DomResult<bool> {
    for pattern in challenge_patterns() {
        match dom.query(&pattern).await {
            Ok(found) if !found.is_empty() => return Ok(true),
            Ok(_) => {}
            Err(e) => skip_candidate(e)?,
        }
    }
    Ok(false)
}

/// Whole-page rate-limit reading from visible text.
pub async fn page_rate_limited<D: DomProvider + ?Sized>(dom: &mut D) -> DomResult<bool> {
    match dom.visible_text(None).await {
        Ok(text) => Ok(signals::is_rate_limited(&text)),
        Err(e) => {
            skip_candidate(e)?;
            Ok(false)
        }
    }
}

/// Classify the current page. Challenge and rate limiting are checked first
/// and suppress the control search.
pub async fn scan<D: DomProvider + ?Sized>(dom: &mut D) -> DomResult<Scan> {
    let challenge = detect_challenge(dom).await?;
    let rate_limited = !challenge && page_rate_limited(dom).await?;
    let found = if challenge || rate_limited {
        None
    } else {
        find_apply_control(dom).await?
    };
    let signal = signals::combine(challenge, rate_limited, found.is_some());
    let (tier, control) = match found {
        Some((t, c)) => (Some(t), Some(c)),
        None => (None, None),
    };
    Ok(Scan {
        signal,
        control,
        tier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{button, input, link, DomOp, Document, Element, MemoryDom};

    const URL: &str = "https://example.test/parent/view.asp?sn=108";

    async fn page(doc: Document) -> MemoryDom {
        let mut dom = MemoryDom::new().page(URL, doc);
        dom.navigate(URL).await.unwrap();
        dom
    }

    #[tokio::test]
    async fn open_label_is_available_pending_is_not() {
        let mut dom = page(Document::new([button("신청 (접수중)")])).await;
        let s = scan(&mut dom).await.unwrap();
        assert_eq!(s.signal, Signal::Available);
        assert_eq!(s.control.unwrap().text, "신청 (접수중)");

        let mut dom = page(Document::new([button("신청예정")])).await;
        let s = scan(&mut dom).await.unwrap();
        assert_eq!(s.signal, Signal::NotAvailable);
        assert!(s.control.is_none());
    }

    #[tokio::test]
    async fn button_group_beats_earlier_unscoped_match() {
        let doc = Document::new([
            link("신청 안내", "/guide"),
            Element::new("div")
                .class("btn-grp")
                .child(Element::new("input").attr("type", "button").value("신청")),
            Element::new("div").class("btn-grp").child(button("신청하기")),
        ]);
        let mut dom = page(doc).await;
        let (tier, c) = find_apply_control(&mut dom).await.unwrap().unwrap();
        assert_eq!(tier, Tier::ButtonGroup);
        assert_eq!(c.tag, "button");
    }

    #[tokio::test]
    async fn first_displayed_match_wins_in_document_order() {
        let doc = Document::new([
            link("신청", "/a").hidden(),
            link("신청예정", "/b"),
            link("신청", "/c"),
            link("신청", "/d"),
        ]);
        let mut dom = page(doc).await;
        let (_, c) = find_apply_control(&mut dom).await.unwrap().unwrap();
        dom.invoke(&c).await.unwrap();
        assert_eq!(dom.current_url().await.unwrap(), "https://example.test/c");
    }

    #[tokio::test]
    async fn status_badge_climbs_to_clickable_ancestor() {
        let doc = Document::new([link("", "/parent/apply.asp").child(
            Element::new("div").child(Element::new("span").class("item-status").text("신청")),
        )]);
        let mut dom = page(doc).await;
        let badge = dom
            .query(&Pattern::tags(&["span"]).class_contains(STATUS_CLASS))
            .await
            .unwrap()
            .remove(0);
        let wrapper = nearest_clickable(&mut dom, &badge).await.unwrap().unwrap();
        assert_eq!(wrapper.tag, "a");

        // The wrapper's own text already carries the badge, so the unscoped
        // tier resolves it first.
        let (tier, c) = find_apply_control(&mut dom).await.unwrap().unwrap();
        assert_eq!(tier, Tier::Unscoped);
        assert_eq!(c, wrapper);
    }

    #[tokio::test]
    async fn ancestor_climb_is_bounded() {
        let mut deep = Element::new("span").class("status").text("신청");
        for _ in 0..ANCESTOR_CLIMB {
            deep = Element::new("div").child(deep);
        }
        let mut dom = page(Document::new([Element::new("button").child(deep)])).await;
        let badge = dom
            .query(&Pattern::tags(&["span"]))
            .await
            .unwrap()
            .remove(0);
        assert!(nearest_clickable(&mut dom, &badge).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_badge_without_clickable_ancestor_is_ignored() {
        let doc = Document::new([Element::new("div")
            .child(Element::new("span").class("status").text("신청"))]);
        let mut dom = page(doc).await;
        assert!(find_apply_control(&mut dom).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn challenge_takes_precedence() {
        let doc = Document::new([
            button("신청"),
            Element::new("img").attr("src", "/img/CaptchaImg.aspx"),
        ]);
        let mut dom = page(doc).await;
        let s = scan(&mut dom).await.unwrap();
        assert_eq!(s.signal, Signal::ChallengePresent);
        assert!(s.control.is_none());

        let mut dom = page(Document::new([Element::new("div").class("g-recaptcha")])).await;
        assert!(detect_challenge(&mut dom).await.unwrap());

        let mut dom = page(Document::new([input("text", "captcha_code")])).await;
        assert!(detect_challenge(&mut dom).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_page_beats_available_control() {
        let doc = Document::new([
            Element::new("p").text("Too Many Requests"),
            button("신청"),
        ]);
        let mut dom = page(doc).await;
        assert_eq!(scan(&mut dom).await.unwrap().signal, Signal::RateLimited);
    }

    #[tokio::test]
    async fn candidate_faults_are_skipped_but_disconnect_is_not() {
        let mut dom = page(Document::new([button("신청")])).await;
        dom.fail_next(DomOp::IsDisplayed, DomError::Stale);
        assert!(find_apply_control(&mut dom).await.unwrap().is_none());

        dom.fail_always(DomOp::Query, DomError::Disconnected("chrome not reachable".into()));
        assert!(scan(&mut dom).await.unwrap_err().is_disconnect());
    }
}
