//! Instruction-to-step compiler
//!
//! Turns a free-text instruction block into typed browser steps with a fixed
//! list of patterns tried in priority order (navigate, click, type, wait,
//! screenshot). The first pattern that matches a line wins; a line matching
//! none of them yields no step. Every compiled sequence ends with one
//! trailing screenshot step, whatever the instructions said.

use crate::types::{StepAction, StepDescriptor};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

/// Label of the screenshot step appended to every run
pub const FINAL_SCREENSHOT: &str = "final";

/// Longest wait a step may ask for; matches the default run ceiling
pub const MAX_WAIT_MS: u64 = 300_000;

static NAVIGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:navigate\s+to|go\s+to|open)\s+(?:the\s+)?(?:(?:url|page|site|website)\s+)?["']?(?P<url>(?:https?://|www\.)\S+|localhost(?::\d+)?(?:/\S*)?|/\S*|[a-z0-9-]+(?:\.[a-z0-9-]+)+(?::\d+)?(?:/\S*)?)"#,
    )
    .expect("navigate pattern")
});

static CLICK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bclick\s+(?:on\s+)?(?:the\s+)?(?:"(?P<dq>[^"]+)"|'(?P<sq>[^']+)'|(?P<bare>[^"'\s].*))"#,
    )
    .expect("click pattern")
});

static TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:type|enter)\s+(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')(?:\s+(?:into|in|on)\s+(?:the\s+)?(?:"(?P<tdq>[^"]+)"|'(?P<tsq>[^']+)'|(?P<tbare>[^"'\s].*)))?"#,
    )
    .expect("type pattern")
});

static WAIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bwait\s+(?:for\s+)?(?P<n>\d+)\s*(?P<unit>milliseconds?|millis|ms|minutes?|mins?|m|seconds?|secs?|s)?\b",
    )
    .expect("wait pattern")
});

static SCREENSHOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)screen\s?shot").expect("screenshot pattern"));

/// Compile an instruction block into an ordered step sequence.
pub fn compile(instructions: &str) -> Vec<StepDescriptor> {
    let mut actions: Vec<StepAction> = Vec::new();

    for line in instructions.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match compile_line(line, actions.len() as u32 + 1) {
            Some(action) => actions.push(action),
            None => debug!("no step pattern matched instruction: {}", line),
        }
    }

    actions.push(StepAction::Screenshot {
        name: FINAL_SCREENSHOT.to_string(),
    });

    actions
        .into_iter()
        .enumerate()
        .map(|(idx, action)| StepDescriptor {
            step_number: idx as u32 + 1,
            description: describe(&action),
            action,
        })
        .collect()
}

/// Match a single trimmed line; `position` names explicit screenshots.
pub fn compile_line(line: &str, position: u32) -> Option<StepAction> {
    if let Some(caps) = NAVIGATE.captures(line) {
        let url = clean_target(&caps["url"]);
        if !url.is_empty() {
            return Some(StepAction::Navigate { url });
        }
    }

    if let Some(caps) = CLICK.captures(line) {
        if let Some(target) = quoted_or_bare(&caps, "dq", "sq", "bare") {
            return Some(StepAction::Click { target });
        }
    }

    if let Some(caps) = TYPE.captures(line) {
        let text = caps
            .name("dq")
            .or_else(|| caps.name("sq"))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let target = quoted_or_bare(&caps, "tdq", "tsq", "tbare");
        return Some(StepAction::Type { text, target });
    }

    if let Some(caps) = WAIT.captures(line) {
        let amount = caps["n"].parse::<u64>().unwrap_or(u64::MAX);
        let unit = caps.name("unit").map(|m| m.as_str().to_ascii_lowercase());
        return Some(StepAction::Wait {
            duration_ms: to_millis(amount, unit.as_deref()),
        });
    }

    if SCREENSHOT.is_match(line) {
        return Some(StepAction::Screenshot {
            name: format!("step-{}", position),
        });
    }

    None
}

fn quoted_or_bare(caps: &Captures<'_>, dq: &str, sq: &str, bare: &str) -> Option<String> {
    if let Some(m) = caps.name(dq).or_else(|| caps.name(sq)) {
        return Some(m.as_str().trim().to_string()).filter(|s| !s.is_empty());
    }
    caps.name(bare)
        .map(|m| clean_target(m.as_str()))
        .filter(|s| !s.is_empty())
}

/// Strip surrounding quotes and trailing sentence punctuation.
fn clean_target(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | '"' | '\''))
        .trim_start_matches(|c: char| c == '"' || c == '\'')
        .trim()
        .to_string()
}

fn to_millis(amount: u64, unit: Option<&str>) -> u64 {
    let factor = match unit {
        Some(u) if u.starts_with("mil") || u == "ms" => 1,
        Some(u) if u.starts_with('m') => 60_000,
        _ => 1_000,
    };
    let millis = amount.saturating_mul(factor);
    if millis > MAX_WAIT_MS {
        debug!("clamping wait of {} ms to {} ms", millis, MAX_WAIT_MS);
    }
    millis.min(MAX_WAIT_MS)
}

fn describe(action: &StepAction) -> String {
    match action {
        StepAction::Navigate { url } => format!("Navigate to {}", url),
        StepAction::Click { target } => format!("Click \"{}\"", target),
        StepAction::Type { text, target: Some(target) } => {
            format!("Type \"{}\" into \"{}\"", text, target)
        }
        StepAction::Type { text, target: None } => format!("Type \"{}\"", text),
        StepAction::Wait { duration_ms } => format!("Wait {} ms", duration_ms),
        StepAction::Screenshot { name } if name == FINAL_SCREENSHOT => {
            "Capture final screenshot".to_string()
        }
        StepAction::Screenshot { .. } => "Take screenshot".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepKind;

    #[test]
    fn test_login_flow_compiles_to_four_steps() {
        let steps = compile("go to https://example.com\nclick \"Login\"\ntype \"bob\" into \"username\"");
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps[0].action,
            StepAction::Navigate {
                url: "https://example.com".into()
            }
        );
        assert_eq!(
            steps[1].action,
            StepAction::Click {
                target: "Login".into()
            }
        );
        assert_eq!(
            steps[2].action,
            StepAction::Type {
                text: "bob".into(),
                target: Some("username".into())
            }
        );
        assert_eq!(
            steps[3].action,
            StepAction::Screenshot {
                name: FINAL_SCREENSHOT.into()
            }
        );
        let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_and_unmatched_blocks_still_end_with_screenshot() {
        for block in ["", "   \n\n", "make sure everything looks fine\nthen relax"] {
            let steps = compile(block);
            assert_eq!(steps.len(), 1, "block {:?}", block);
            assert_eq!(steps[0].kind(), StepKind::Screenshot);
            assert_eq!(steps[0].description, "Capture final screenshot");
        }
    }

    #[test]
    fn test_trailing_screenshot_added_even_after_explicit_one() {
        let steps = compile("open www.example.org\ntake a screenshot");
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[1].action,
            StepAction::Screenshot {
                name: "step-2".into()
            }
        );
        assert_eq!(
            steps[2].action,
            StepAction::Screenshot {
                name: FINAL_SCREENSHOT.into()
            }
        );
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        // navigate beats click and screenshot on the same line
        assert!(matches!(
            compile_line("Go to http://localhost:3000/login and click Submit", 1),
            Some(StepAction::Navigate { url }) if url == "http://localhost:3000/login"
        ));
        // click beats screenshot
        assert!(matches!(
            compile_line("click the Screenshot button", 1),
            Some(StepAction::Click { target }) if target == "Screenshot button"
        ));
    }

    #[test]
    fn test_navigate_variants() {
        assert!(matches!(
            compile_line("Navigate to the page /dashboard.", 1),
            Some(StepAction::Navigate { url }) if url == "/dashboard"
        ));
        assert!(matches!(
            compile_line("Open \"https://example.com/a?b=c\"", 1),
            Some(StepAction::Navigate { url }) if url == "https://example.com/a?b=c"
        ));
        assert_eq!(compile_line("open the settings menu", 1), None);
    }

    #[test]
    fn test_type_without_target_and_bare_target() {
        assert_eq!(
            compile_line("Enter 'secret'", 1),
            Some(StepAction::Type {
                text: "secret".into(),
                target: None
            })
        );
        assert_eq!(
            compile_line("type \"bob@example.com\" in the email field.", 1),
            Some(StepAction::Type {
                text: "bob@example.com".into(),
                target: Some("email field".into())
            })
        );
    }

    #[test]
    fn test_wait_units() {
        assert_eq!(
            compile_line("wait 2 seconds", 1),
            Some(StepAction::Wait { duration_ms: 2000 })
        );
        assert_eq!(
            compile_line("Wait for 500ms", 1),
            Some(StepAction::Wait { duration_ms: 500 })
        );
        assert_eq!(
            compile_line("wait 1 minute", 1),
            Some(StepAction::Wait { duration_ms: 60_000 })
        );
        assert_eq!(compile_line("wait 3", 1), Some(StepAction::Wait { duration_ms: 3000 }));
        assert_eq!(compile_line("wait until the spinner goes away", 1), None);
    }

    #[test]
    fn test_huge_wait_is_clamped() {
        let steps = compile("wait 99999999999999999999999 seconds");
        assert_eq!(steps[0].action, StepAction::Wait { duration_ms: MAX_WAIT_MS });
        assert_eq!(
            compile_line("wait 10 minutes", 1),
            Some(StepAction::Wait { duration_ms: MAX_WAIT_MS })
        );
        assert_eq!(
            compile_line("wait 5 minutes", 1),
            Some(StepAction::Wait { duration_ms: 300_000 })
        );
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let block = "go to https://example.com\nclick Login\nwait 1\nscreenshot please";
        assert_eq!(compile(block), compile(block));
    }
}
