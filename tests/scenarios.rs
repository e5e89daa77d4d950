//! End-to-end runs of the engine against the in-memory page model on a
//! virtual clock.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use openslot::browser::memory::{button, input, label, DomOp, Document, Effect, Element, MemoryDom};
use openslot::engine::clock::{Clock, ManualClock, Pacer};
use openslot::engine::schedule::ScheduleWindow;
use openslot::features::artifacts::MemoryArtifacts;
use openslot::features::signals::{classify_label, LabelState};
use openslot::{
    AcquisitionPath, AppState, DomError, Engine, EngineConfig, EngineError, PollState, RunOutcome, Runner,
    SessionFactory, UserProfile,
};

const TARGET: &str = "https://example.test/parent/Appchild_view.asp?sn=108";
const FORM: &str = "https://example.test/parent/Appchild_regist.asp?sn=108";
const DONE: &str = "https://example.test/parent/Appchild_regist_ok.asp";
const MYPAGE: &str = "https://example.test/mypage/apply_list.asp";

fn trace() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("openslot=debug"))
        .with_test_writer()
        .try_init();
}

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 8, 19)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn config(open_at: Option<NaiveDateTime>) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.target_url = Some(TARGET.into());
    cfg.open_at = open_at;
    cfg.profile = UserProfile::from_pairs([("child_name", "조하늘"), ("phone", "010-1234-5678")]);
    cfg
}

fn apply_form() -> Document {
    Document::new([Element::new("form").attr("action", DONE).children([
        label("cname", "자녀 이름"),
        input("text", "child_name").id("cname"),
        label("tel", "연락처"),
        input("text", "tel").id("tel"),
        input("checkbox", "agree_all").id("chkall"),
        Element::new("input").attr("type", "submit").value("신청"),
    ])])
}

fn open_page(label_text: &str) -> Document {
    Document::new([Element::new("div")
        .class("btn-grp")
        .child(button(label_text).on_invoke(Effect::Navigate(FORM.into())))])
}

fn pending_page() -> Document {
    Document::new([Element::new("div").class("btn-grp").child(button("신청예정"))])
}

struct Rig {
    clock: Arc<ManualClock>,
    pacer: Pacer,
    sink: MemoryArtifacts,
}

fn rig(start: NaiveDateTime) -> Rig {
    let clock = Arc::new(ManualClock::new(start));
    Rig {
        pacer: Pacer::unattended(clock.clone()),
        clock,
        sink: MemoryArtifacts::new(),
    }
}

async fn run(dom: &mut MemoryDom, cfg: &EngineConfig, r: &Rig) -> Result<RunOutcome, EngineError> {
    let window = ScheduleWindow::from_timing(r.pacer.now(), cfg.open_at, &cfg.timing);
    let mut engine = Engine::new(dom, cfg, &r.pacer, &r.sink, window);
    engine.run().await
}

fn position(events: &[String], needle: &str) -> Option<usize> {
    events.iter().position(|e| e.contains(needle))
}

// ─── Scenario A: coarse wait, keep-warm refresh, fine cadence ──────────────

#[tokio::test]
async fn coarse_wait_refreshes_at_the_boundary_then_polls_finely() {
    trace();
    let r = rig(at(9, 40, 0));
    let cfg = config(Some(at(10, 0, 0)));
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .page(TARGET, pending_page());

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert_eq!(out.final_state, PollState::TimedOut);

    let refreshes: Vec<NaiveDateTime> = dom.refresh_times().into_iter().flatten().collect();
    let coarse: Vec<_> = refreshes.iter().filter(|t| **t < at(9, 55, 0)).collect();
    assert_eq!(coarse, vec![&at(9, 50, 0)]);

    let fine: Vec<_> = refreshes
        .iter()
        .copied()
        .filter(|t| *t >= at(9, 55, 0) && *t < at(10, 0, 0))
        .collect();
    assert_eq!(fine.first(), Some(&at(9, 55, 0)));
    assert!(fine.len() >= 50, "only {} fine refreshes", fine.len());
    for pair in fine.windows(2) {
        let gap = (pair[1] - pair[0]).num_milliseconds();
        assert!((4000..=6000).contains(&gap), "fine gap {gap}ms");
    }

    // The window closes five minutes after the target, give or take one tick.
    assert!(r.clock.now() >= at(10, 5, 0));
    assert!(r.clock.now() <= at(10, 5, 6));

    let events = r.sink.events();
    let coarse_at = position(&events, "state -> WaitingCoarse").unwrap();
    let fine_at = position(&events, "state -> WaitingFine").unwrap();
    assert!(coarse_at < fine_at);
    assert!(events[coarse_at..fine_at]
        .iter()
        .any(|e| e.starts_with("[09:50:00]") && e.contains("keep-warm refresh")));
}

// ─── Scenario B: availability text ─────────────────────────────────────────

#[test]
fn availability_labels() {
    assert_eq!(classify_label("신청 (접수중)"), LabelState::Open);
    assert_eq!(classify_label("신청예정"), LabelState::Pending);
    assert_eq!(classify_label("신청마감"), LabelState::Closed);
}

#[tokio::test]
async fn receiving_label_is_acted_on_and_pending_is_not() {
    let r = rig(at(10, 0, 0));
    let cfg = config(None);
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .pages(
            TARGET,
            [pending_page(), pending_page(), open_page("신청 (접수중)")],
        )
        .page(FORM, apply_form())
        .page(DONE, Document::text("신청이 완료되었습니다"));

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert_eq!(out.final_state, PollState::Submitted);
    assert_eq!(out.path, Some(AcquisitionPath::Control));
    assert_eq!(dom.refresh_times().len(), 2);
    assert!(dom
        .writes()
        .contains(&("child_name".to_string(), "조하늘".to_string())));
    assert!(r.sink.has_file("submission_result.html"));
}

// ─── Scenario C: backoff on consecutive rate limits ────────────────────────

#[tokio::test]
async fn consecutive_rate_limit_alerts_double_to_the_ceiling() {
    let r = rig(at(10, 0, 0));
    let cfg = config(None);
    let throttled = || {
        Document::new([button("신청").on_invoke(Effect::Dialog(
            "요청이 많아 잠시 후 다시 시도해 주세요".into(),
        ))])
    };
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .pages(
            TARGET,
            [
                throttled(),
                throttled(),
                throttled(),
                throttled(),
                throttled(),
                open_page("신청"),
            ],
        )
        .page(FORM, apply_form())
        .page(DONE, Document::text("ok"));

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert!(out.submitted);
    let secs: Vec<Duration> = [12, 24, 48, 60].into_iter().map(Duration::from_secs).collect();
    assert_eq!(&r.clock.sleeps()[..4], secs.as_slice());
    assert!(r.sink.logged("rate limited (dialog), backing off 60s"));
}

#[tokio::test]
async fn one_clean_tick_resets_the_backoff() {
    let r = rig(at(10, 0, 0));
    let cfg = config(None);
    let limited = || Document::text("요청이 많습니다. 잠시 후 다시 시도해 주세요.");
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .pages(
            TARGET,
            [
                pending_page(),
                limited(),
                limited(),
                pending_page(),
                limited(),
                open_page("신청"),
            ],
        )
        .page(FORM, apply_form())
        .page(DONE, Document::text("ok"));

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert!(out.submitted);
    let sleeps = r.clock.sleeps();
    assert_eq!(sleeps[0], Duration::from_secs(12));
    assert_eq!(sleeps[1], Duration::from_secs(24));
    assert!(sleeps[2] >= Duration::from_secs(4) && sleeps[2] <= Duration::from_secs(6));
    assert_eq!(sleeps[3], Duration::from_secs(12));
}

// ─── Scenario D: verification ──────────────────────────────────────────────

fn status_page(cells: &[&str]) -> Document {
    Document::new([Element::new("table").child(
        Element::new("tr").children(cells.iter().map(|c| Element::new("td").text(c))),
    )])
}

#[tokio::test]
async fn matching_status_row_verifies_the_submission() {
    let r = rig(at(10, 0, 0));
    let mut cfg = config(None);
    cfg.status_url = Some(MYPAGE.into());
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .page(TARGET, open_page("신청"))
        .page(FORM, apply_form())
        .page(DONE, Document::text("ok"))
        .page(MYPAGE, status_page(&["108", "가을 숲 체험", "접수완료"]));

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert_eq!(out.final_state, PollState::Verified);
    assert_eq!(out.verified, Some(true));
    let summary = r.sink.json("verify_summary.json").unwrap();
    assert_eq!(summary["sn"], "108");
    assert_eq!(summary["found"], true);
    assert_eq!(summary["matches"][0]["type"], "row_contains_sn");
    assert!(r.sink.has_file("verify_mypage.html"));
    assert!(r.sink.logged("[verify] MyPage check: sn=108, found=true"));
}

#[tokio::test]
async fn missing_evidence_is_reported_not_raised() {
    let r = rig(at(10, 0, 0));
    let mut cfg = config(None);
    cfg.status_url = Some(MYPAGE.into());
    let mut dom = MemoryDom::new()
        .with_clock(r.clock.clone())
        .page(TARGET, open_page("신청"))
        .page(FORM, apply_form())
        .page(DONE, Document::text("ok"))
        .page(MYPAGE, status_page(&["107", "여름 캠프", "접수완료"]));

    let out = run(&mut dom, &cfg, &r).await.unwrap();
    assert_eq!(out.final_state, PollState::Submitted);
    assert_eq!(out.verified, Some(false));
    assert!(out.submitted);
    assert_eq!(r.sink.json("verify_summary.json").unwrap()["found"], false);
}

// ─── Session restarts ──────────────────────────────────────────────────────

struct Scripted {
    sessions: VecDeque<MemoryDom>,
    opened: usize,
}

#[async_trait]
impl SessionFactory for Scripted {
    type Session = MemoryDom;

    async fn open(&mut self) -> Result<MemoryDom, EngineError> {
        self.opened += 1;
        self.sessions
            .pop_front()
            .ok_or_else(|| EngineError::Disconnect("no browser".into()))
    }
}

fn dropped_session(clock: &Arc<ManualClock>) -> MemoryDom {
    let mut dom = MemoryDom::new()
        .with_clock(clock.clone())
        .page(TARGET, pending_page());
    dom.fail_always(DomOp::ExecInert, DomError::Disconnected("invalid session id".into()));
    dom
}

#[tokio::test]
async fn lost_session_restarts_and_still_acquires() {
    trace();
    let r = rig(at(10, 0, 0));
    let cfg = config(None);
    let healthy = MemoryDom::new()
        .with_clock(r.clock.clone())
        .page(TARGET, open_page("신청"))
        .page(FORM, apply_form())
        .page(DONE, Document::text("ok"));
    let factory = Scripted {
        sessions: VecDeque::from([dropped_session(&r.clock), healthy]),
        opened: 0,
    };
    let mut runner = Runner::new(factory, &cfg, r.pacer.clone(), &r.sink);
    let out = runner.run().await.unwrap();
    assert!(out.submitted);
    assert_eq!(runner.factory().opened, 2);
    assert!(r.sink.logged("session lost"));
    assert!(r.clock.sleeps().contains(&Duration::from_millis(1000)));
}

#[tokio::test]
async fn restart_budget_is_bounded() {
    let r = rig(at(10, 0, 0));
    let mut cfg = config(None);
    cfg.backoff.max_restarts = 1;
    let factory = Scripted {
        sessions: VecDeque::from([dropped_session(&r.clock), dropped_session(&r.clock)]),
        opened: 0,
    };
    let mut runner = Runner::new(factory, &cfg, r.pacer.clone(), &r.sink);
    let err = runner.run().await.unwrap_err();
    assert!(matches!(err, EngineError::RestartsExhausted { restarts: 1, .. }));
    assert_eq!(runner.factory().opened, 2);
}

// ─── Cancellation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn operator_abort_stops_the_coarse_wait() {
    let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
    let cfg = config(Some(at(10, 0, 0)));
    let state = AppState::new(cfg.clone(), reqwest::Client::new());
    let pacer = Pacer::new(clock.clone(), state.abort_receiver());
    let sink = MemoryArtifacts::new();
    let factory = Scripted {
        sessions: VecDeque::from([MemoryDom::new().page(TARGET, pending_page())]),
        opened: 0,
    };
    state.abort();
    let mut runner = Runner::new(factory, &cfg, pacer, &sink);
    assert!(matches!(runner.run().await, Err(EngineError::Cancelled)));
    assert!(state.is_aborted());
}
