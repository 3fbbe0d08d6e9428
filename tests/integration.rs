use std::path::Path;

use chat_autopilot::classify;
use chat_autopilot::config::{ObserverConfig, UsageLimitScope};
use chat_autopilot::dom::Document;
use chat_autopilot::replay::{self, Effect, ReplayReport};
use chat_autopilot::scenario::{Scenario, Step};
use chat_autopilot::settings::Settings;
use chat_autopilot::tracker::{ConcernKind, ObservedState};

// ── Test Fixtures ───────────────────────────────────────────────────────────

const RUNNING_PAGE: &str = include_str!("fixtures/chat_running.html");
const IDLE_PAGE: &str = include_str!("fixtures/chat_idle.html");
const TRUNCATED_PAGE: &str = include_str!("fixtures/chat_truncated.html");

const STOPPED_BUTTON: &str = r#"<button aria-label="Send message" class="inline-flex h-8 w-8 bg-accent-main-000 text-oncolor-100 rounded-md" type="button"><svg viewBox="0 0 256 256"><path d="M208.49,120.49a12,12,0,0,1-17,0L140,69V216a12,12,0,0,1-24,0V69Z"></path></svg></button>"#;
const RUNNING_BUTTON: &str = r#"<button aria-label="Stop response" class="inline-flex h-8 w-8 border-0.5 border-border-300 rounded-md" type="button"><svg viewBox="0 0 256 256"><path d="M128,20A108,108,0,1,0,236,128,108.12,108.12,0,0,0,128,20Z"></path></svg></button>"#;
const ALLOW_MODAL: &str = r#"<div class="fixed inset-0 z-modal"><div role="dialog"><h2>Allow tool use?</h2><button type="button">Deny</button><button type="button">Allow for this chat</button></div></div>"#;
const OTHER_MODAL: &str = r#"<div class="fixed inset-0 z-modal"><div role="dialog"><h2>Share chat</h2><button type="button">Copy link</button></div></div>"#;

fn scenario(html: &str, steps: Vec<Step>) -> Scenario {
    Scenario {
        name: "test".into(),
        description: None,
        html: html.into(),
        html_file: None,
        config: ObserverConfig::default(),
        settings: Settings::default(),
        foreground: false,
        steps,
    }
}

fn run(s: &Scenario) -> ReplayReport {
    replay::run(s, false).expect("replay failed")
}

fn append(target: &str, html: &str) -> Step {
    Step::AppendHtml {
        target: target.into(),
        html: html.into(),
    }
}

fn remove(target: &str) -> Step {
    Step::Remove {
        target: target.into(),
    }
}

fn advance(ms: u64) -> Step {
    Step::Advance { ms }
}

/// Steps that swap the composer's toggle from RUNNING to STOPPED in one burst.
fn finish_response() -> Vec<Step> {
    vec![remove("#composer button"), append("#composer", STOPPED_BUTTON)]
}

// ── Classification on fixtures ──────────────────────────────────────────────

#[test]
fn fixtures_classify_as_expected() {
    assert_eq!(
        classify::classify_response(&Document::parse(RUNNING_PAGE)),
        ObservedState::ButtonRunning
    );
    assert_eq!(
        classify::classify_response(&Document::parse(IDLE_PAGE)),
        ObservedState::Unknown
    );
    let truncated = Document::parse(TRUNCATED_PAGE);
    assert_eq!(classify::classify_response(&truncated), ObservedState::ButtonStopped);
    assert_eq!(classify::find_continue_buttons(&truncated).len(), 1);
    assert_eq!(classify::classify_modal(&truncated), ObservedState::ModalAbsent);
}

// ── Scenario A: RUNNING mutated in place to STOPPED ─────────────────────────

#[test]
fn scenario_a_in_place_completion_notifies_once() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/scenario_response_complete.json");
    let s = Scenario::load(&path).unwrap();
    assert_eq!(s.name, "response-complete");

    let report = run(&s);
    assert_eq!(report.notifications(), 1);
    assert_eq!(
        report.favicon_swaps(),
        vec!["chrome-extension://chat-autopilot/images/favicon-ping.png"]
    );
    assert_eq!(report.logged("Tracking button in state: RUNNING"), 1);
    assert_eq!(report.logged("Response state changed: RUNNING → STOPPED"), 1);
    assert_eq!(report.transitions.len(), 1);

    let Effect::Notification { title, message, .. } = report
        .effects
        .iter()
        .find(|e| matches!(e, Effect::Notification { .. }))
        .unwrap()
    else {
        unreachable!()
    };
    assert_eq!(title, "Claude Response Complete");
    assert_eq!(message, "Your Claude response has finished generating.");
}

// ── Scenario B: STOPPED with no prior RUNNING ───────────────────────────────

#[test]
fn scenario_b_first_sighting_only_tracks() {
    let report = run(&scenario(
        IDLE_PAGE,
        vec![append("#composer", STOPPED_BUTTON), advance(500)],
    ));
    assert_eq!(report.notifications(), 0);
    assert!(report.favicon_swaps().is_empty());
    assert_eq!(report.logged("Tracking button in state"), 1);
    assert_eq!(report.logged("Tracking button in state: STOPPED"), 1);
}

// ── Scenario C/D: permission modal ──────────────────────────────────────────

#[test]
fn scenario_c_allow_modal_is_approved_once() {
    let report = run(&scenario(
        IDLE_PAGE,
        vec![append("body", ALLOW_MODAL), advance(300), advance(300)],
    ));
    assert_eq!(report.clicks(), vec!["Allow for this chat"]);
    assert_eq!(report.logged("Clicking \"Allow for this chat\" button"), 1);
    assert!(report.markers.is_empty());
}

#[test]
fn scenario_c_inert_mode_writes_one_marker() {
    let report = replay::run(
        &scenario(IDLE_PAGE, vec![append("body", ALLOW_MODAL), advance(300)]),
        true,
    )
    .unwrap();
    assert!(report.clicks().is_empty());
    assert_eq!(report.markers, vec!["Allow for this chat".to_string()]);
    assert_eq!(report.logged("Test mode: Would click \"Allow for this chat\" button"), 1);
}

#[test]
fn scenario_d_unrelated_modal_does_nothing() {
    let report = run(&scenario(IDLE_PAGE, vec![append("body", OTHER_MODAL), advance(300)]));
    assert!(report.clicks().is_empty());
    assert!(report.markers.is_empty());
}

#[test]
fn modal_reopened_later_is_approved_again() {
    let report = run(&scenario(
        IDLE_PAGE,
        vec![
            append("body", ALLOW_MODAL),
            advance(300),
            remove(".z-modal"),
            advance(300),
            append("body", ALLOW_MODAL),
            advance(300),
        ],
    ));
    assert_eq!(report.clicks().len(), 2);
    let modal_transitions: Vec<String> = report
        .transitions
        .iter()
        .filter(|t| t.concern == ConcernKind::Modal)
        .map(|t| t.to_string())
        .collect();
    assert_eq!(
        modal_transitions,
        vec!["ABSENT → PRESENT", "PRESENT → ABSENT", "ABSENT → PRESENT"]
    );
}

#[test]
fn quick_second_modal_is_approved_after_backoff() {
    let report = run(&scenario(
        IDLE_PAGE,
        vec![
            append("body", ALLOW_MODAL),
            advance(300),
            remove(".z-modal"),
            advance(100),
            append("body", ALLOW_MODAL),
            advance(1500),
        ],
    ));
    let clicked_at: Vec<u64> = report
        .effects
        .iter()
        .filter_map(|e| match e {
            Effect::Click { at_ms, .. } => Some(*at_ms),
            _ => None,
        })
        .collect();
    assert_eq!(clicked_at, vec![150, 1150]);
    assert_eq!(report.logged("too soon after previous press"), 1);
}

#[test]
fn modal_already_open_can_be_left_alone() {
    let page = IDLE_PAGE.replace("</main>", &format!("</main>{ALLOW_MODAL}"));
    let mut s = scenario(&page, vec![advance(500)]);
    s.config.modal_click_preexisting = false;
    assert!(run(&s).clicks().is_empty());

    s.config.modal_click_preexisting = true;
    assert_eq!(run(&s).clicks(), vec!["Allow for this chat"]);
}

// ── Scenario E: burst inside the debounce window ────────────────────────────

#[test]
fn scenario_e_burst_yields_one_transition() {
    let mut steps = vec![advance(1000)];
    steps.extend(finish_response());
    steps.push(advance(40));
    steps.push(Step::SetAttribute {
        target: "#composer button".into(),
        name: "class".into(),
        value: "inline-flex h-8 w-8 bg-accent-main-000 text-oncolor-100 rounded-md hover:opacity-90".into(),
    });
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    let response: Vec<_> = report
        .transitions
        .iter()
        .filter(|t| t.concern == ConcernKind::Response)
        .collect();
    assert_eq!(response.len(), 1);
    assert!(response[0].is(ObservedState::ButtonRunning, ObservedState::ButtonStopped));
    assert_eq!(report.notifications(), 1);
}

#[test]
fn unclassifiable_frame_does_not_break_history() {
    let steps = vec![
        advance(1000),
        remove("#composer button"),
        append("#composer", r#"<button aria-label="Stop response" class="animate-pulse"></button>"#),
        advance(300),
        remove("#composer button"),
        append("#composer", RUNNING_BUTTON),
        advance(300),
    ];
    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.transitions.is_empty());
    assert_eq!(report.notifications(), 0);
}

#[test]
fn full_cycle_swaps_favicon_busy_then_ping() {
    let mut steps = vec![advance(1000)];
    steps.extend(finish_response());
    steps.push(advance(300));
    steps.push(remove("#composer button"));
    steps.push(append("#composer", RUNNING_BUTTON));
    steps.push(advance(300));
    steps.extend(finish_response());
    steps.push(advance(300));

    let report = run(&scenario(RUNNING_PAGE, steps));
    let swaps = report.favicon_swaps();
    assert_eq!(swaps.len(), 3);
    assert!(swaps[0].ends_with("favicon-ping.png"));
    assert!(swaps[1].ends_with("favicon-busy.png"));
    assert!(swaps[2].ends_with("favicon-ping.png"));
    assert_eq!(report.notifications(), 2);
}

#[test]
fn favicon_reverts_when_tab_comes_to_front() {
    let mut steps = vec![advance(1000)];
    steps.extend(finish_response());
    steps.push(advance(300));
    steps.push(Step::Visibility { foreground: true });

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert_eq!(report.favicon_swaps().last().copied(), Some("/images/claude_app_icon.png"));
    assert!(!report.favicon.is_modified);
    assert_eq!(report.logged("Favicon restored"), 1);
}

// ── Continue button ─────────────────────────────────────────────────────────

#[test]
fn continue_present_at_load_is_never_clicked() {
    let report = run(&scenario(TRUNCATED_PAGE, vec![advance(10_000)]));
    assert!(report.clicks().is_empty());
    assert_eq!(report.logged("Continue button found during page load, not clicking"), 1);
    assert!(report.logged("Continue button found but not in appropriate state for clicking") >= 1);
}

#[test]
fn continue_after_completion_is_clicked_once() {
    let mut steps = vec![advance(4000)];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div class="message"><p>...</p><div class="actions"><button type="button">Continue</button></div></div>"#,
    ));
    steps.push(advance(1000));
    steps.push(append("#chat", "<p>unrelated</p>"));
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert_eq!(report.clicks(), vec!["Continue"]);
    assert_eq!(
        report.logged("Clicking \"Continue\" button after RUNNING -> STOPPED transition"),
        1
    );
}

#[test]
fn disabled_continue_is_clicked_once_it_enables() {
    let mut steps = vec![advance(4000)];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div><div class="actions"><button id="cont" type="button" disabled>Continue</button></div></div>"#,
    ));
    steps.push(advance(1000));
    steps.push(Step::RemoveAttribute {
        target: "#cont".into(),
        name: "disabled".into(),
    });
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.logged("button disabled") >= 1);
    assert_eq!(report.clicks(), vec!["Continue"]);
    let clicked_at: Vec<u64> = report
        .effects
        .iter()
        .filter_map(|e| match e {
            Effect::Click { at_ms, .. } => Some(*at_ms),
            _ => None,
        })
        .collect();
    assert!(clicked_at[0] >= 5000, "clicked while disabled at {}ms", clicked_at[0]);
}

#[test]
fn aria_disabled_continue_is_not_clicked() {
    let mut steps = vec![advance(4000)];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div class="actions"><button type="button" aria-disabled="true">Continue</button></div>"#,
    ));
    steps.push(advance(2000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.clicks().is_empty());
    assert!(report.logged("button disabled") >= 1);
}

#[test]
fn inert_continue_leaves_its_own_marker() {
    let mut steps = vec![advance(4000)];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div class="actions"><button type="button">Continue</button></div>"#,
    ));
    steps.push(advance(1000));

    let report = replay::run(&scenario(RUNNING_PAGE, steps), true).unwrap();
    assert!(report.clicks().is_empty());
    assert!(report.markers.is_empty());
    assert_eq!(report.continue_markers, vec!["Continue".to_string()]);
}

#[test]
fn continue_waits_for_running_response_to_stop() {
    let mut steps = vec![
        advance(4000),
        append(
            "#chat",
            r#"<div class="actions"><button type="button">Continue</button></div>"#,
        ),
        advance(300),
    ];
    steps.extend(finish_response());
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert_eq!(report.logged("response still running"), 1);
    assert_eq!(report.clicks(), vec!["Continue"]);
}

#[test]
fn completion_during_grace_window_clicks_after_it() {
    let mut steps = finish_response();
    steps.push(append(
        "#chat",
        r#"<div class="actions"><button type="button">Continue</button></div>"#,
    ));
    steps.push(advance(500));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.logged("waiting for the page to settle") >= 1);
    assert_eq!(report.clicks(), vec!["Continue"]);
    let Effect::Click { at_ms, .. } = report
        .effects
        .iter()
        .find(|e| matches!(e, Effect::Click { .. }))
        .unwrap()
    else {
        unreachable!()
    };
    assert!(*at_ms >= 3000);
}

#[test]
fn usage_limit_overrides_eligibility() {
    let mut steps = vec![advance(4000)];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div class="message"><p>You've reached your usage limit. Your limit will reset at 5:00 PM.</p><div class="actions"><button type="button">Continue</button></div></div>"#,
    ));
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.clicks().is_empty());
    assert!(report.logged("usage limit reached") >= 1);
}

#[test]
fn document_scoped_usage_limit_sees_distant_banners() {
    let mut steps = vec![
        advance(4000),
        append("body", r#"<aside class="banner"><p>You are out of free messages until 5 PM</p></aside>"#),
    ];
    steps.extend(finish_response());
    steps.push(append(
        "#chat",
        r#"<div><div class="actions"><button type="button">Continue</button></div></div>"#,
    ));
    steps.push(advance(1000));

    let mut s = scenario(RUNNING_PAGE, steps);
    assert_eq!(run(&s).clicks(), vec!["Continue"]);

    s.config.usage_limit_scope = UsageLimitScope::Document;
    assert!(run(&s).clicks().is_empty());
}

#[test]
fn disabled_setting_pushed_mid_session_blocks_continue() {
    let mut steps = vec![
        advance(4000),
        Step::UpdateSettings {
            settings: Settings {
                auto_continue_enabled: false,
            },
        },
    ];
    steps.extend(finish_response());
    steps.push(append("#chat", r#"<div><button type="button">Continue</button></div>"#));
    steps.push(advance(1000));

    let report = run(&scenario(RUNNING_PAGE, steps));
    assert!(report.clicks().is_empty());
    assert!(report.logged("auto-continue disabled") >= 1);
    assert_eq!(report.logged("Settings updated: autoContinueEnabled=false"), 1);
}

// ── Environment ─────────────────────────────────────────────────────────────

#[test]
fn replay_page_forces_marker_mode() {
    let page = IDLE_PAGE.replace(r#"<body class="font-ui">"#, r#"<body class="font-ui" data-rrweb-test="true">"#);
    let report = run(&scenario(&page, vec![append("body", ALLOW_MODAL), advance(300)]));
    assert!(report.clicks().is_empty());
    assert_eq!(report.markers, vec!["Allow for this chat".to_string()]);
    assert_eq!(report.logged("Replay environment detected"), 1);
}

// ── Report output ───────────────────────────────────────────────────────────

#[test]
fn json_report_shape() {
    let mut steps = vec![advance(1000)];
    steps.extend(finish_response());
    steps.push(advance(300));
    let report = run(&scenario(RUNNING_PAGE, steps));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["scenario"], "test");
    let kinds: Vec<&str> = json["effects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["effect"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["favicon", "notification"]);
    assert_eq!(json["transitions"][0]["from"], "ButtonRunning");
    assert_eq!(json["transitions"][0]["concern"], "response");
    assert!(json["log"][0]["line"].is_string());
    assert!(report.to_text().contains("response: RUNNING → STOPPED"));
}
