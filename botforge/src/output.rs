//! Console rendering of session events.
//!
//! Each line carries a role prefix (`[build]`, `[runtime]`, `[session]`) so
//! the two log phases stay readable when they interleave.

use botforge_sdk::{LogEntry, LogKind};

use crate::event::SessionEvent;
use crate::logs::Phase;

/// Long lines are wrapped to this width.
const MAX_LINE: usize = 160;

/// Render one event as console lines.
pub fn render(event: &SessionEvent) -> Vec<String> {
    match event {
        SessionEvent::StateChanged { from, to } => {
            vec![format!("[session] {from} → {to}")]
        }
        SessionEvent::RuntimeChanged { to, .. } => {
            vec![format!("[runtime] ▶ bot is {to}")]
        }
        SessionEvent::Log { phase, entry } => log_lines(*phase, entry),
        SessionEvent::RepairApplied {
            attempt,
            confidence,
            summaries,
        } => {
            let mut lines = vec![format!(
                "[build] 🔧 repair {attempt} applied ({:.0}% confident)",
                confidence * 100.0
            )];
            lines.extend(summaries.iter().map(|s| format!("  {s}")));
            lines
        }
        SessionEvent::RuntimeStartFailed { message } => {
            vec![format!("[runtime] ❌ could not start: {message}")]
        }
    }
}

fn log_lines(phase: Phase, entry: &LogEntry) -> Vec<String> {
    let marker = match entry.kind {
        LogKind::Error => "❌ ",
        LogKind::User => "> ",
        LogKind::Bot => "🤖 ",
        LogKind::Log | LogKind::Raw => "",
    };
    let time = entry.timestamp.format("%H:%M:%S");
    wrap_lines(&entry.message, MAX_LINE)
        .into_iter()
        .map(|line| format!("[{phase}] {time} {marker}{line}"))
        .collect()
}

/// Print one event to stdout.
pub fn print(event: &SessionEvent) {
    for line in render(event) {
        println!("{line}");
    }
}

/// Wrap text into lines of max_len, breaking on word boundaries.
fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    let mut result = Vec::new();
    for line in text.lines() {
        if line.len() <= max_len {
            result.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            if !current.is_empty() && current.len() + word.len() + 1 > max_len {
                result.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            result.push(current);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BuildState;

    #[test]
    fn wraps_on_word_boundaries() {
        let lines = wrap_lines("alpha beta gamma delta", 11);
        assert_eq!(lines, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn multi_line_log_keeps_prefix_on_every_line() {
        let event = SessionEvent::Log {
            phase: Phase::Build,
            entry: LogEntry::error("Traceback\nImportError: aiogram"),
        };
        let lines = render(&event);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.starts_with("[build] ")));
        assert!(lines[1].ends_with("❌ ImportError: aiogram"));
    }

    #[test]
    fn state_change_line() {
        let event = SessionEvent::StateChanged {
            from: BuildState::Coding,
            to: BuildState::Building,
        };
        assert_eq!(render(&event), vec!["[session] CODING → BUILDING"]);
    }
}
