//! The `TODO.md` adapter (§6, §9 "TODO.md mutation under races"): a
//! line-oriented grammar, not a full Markdown parser, matching the
//! teacher's preference for targeted string/regex handling over a
//! heavyweight parser dependency. Treated as a CRDT-like file with
//! line-addressed edits and optimistic concurrency via `git push` — a push
//! rejection is the conflict signal, handled by the retry loop in
//! `commit_and_push`.

use std::fmt::Write as _;
use std::path::Path;

use chrono::Utc;
use foreman_process::run_with_timeout;
use foreman_retry::{calculate_delay, RetryStrategyConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkbox {
    Open,
    Done,
    Cancelled,
    FailedVerification,
}

impl Checkbox {
    fn marker(&self) -> &'static str {
        match self {
            Checkbox::Open => " ",
            Checkbox::Done => "x",
            Checkbox::Cancelled => "-",
            Checkbox::FailedVerification => "!",
        }
    }

    fn from_marker(s: &str) -> Option<Self> {
        Some(match s {
            " " => Checkbox::Open,
            "x" | "X" => Checkbox::Done,
            "-" => Checkbox::Cancelled,
            "!" => Checkbox::FailedVerification,
            _ => return None,
        })
    }
}

/// A parsed `- [ ] <task_id> <description>[ assignee:<ident>]...` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoEntry {
    pub indent: usize,
    pub checkbox: Checkbox,
    pub task_id: String,
    pub description: String,
    pub assignee: Option<String>,
    pub started: Option<String>,
    pub completed: Option<String>,
    pub tags: Vec<String>,
    pub issue_ref: Option<String>,
}

/// Parse one `TODO.md` line, returning `None` for lines that aren't a task
/// entry (headers, blank lines, free-form notes).
pub fn parse_line(line: &str) -> Option<TodoEntry> {
    let indent = line.len() - line.trim_start().len();
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("- [")?;
    let (marker, rest) = rest.split_at(1);
    let checkbox = Checkbox::from_marker(marker)?;
    let rest = rest.strip_prefix("] ")?;

    let mut fields = rest.split(' ');
    let task_id = fields.next()?.to_string();

    let mut description_words = Vec::new();
    let mut assignee = None;
    let mut started = None;
    let mut completed = None;
    let mut tags = Vec::new();
    let mut issue_ref = None;

    for word in fields {
        if let Some(v) = word.strip_prefix("assignee:") {
            assignee = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix("started:") {
            started = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix("completed:") {
            completed = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix("ref:") {
            issue_ref = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix('#') {
            tags.push(v.to_string());
        } else if !word.is_empty() {
            description_words.push(word);
        }
    }

    Some(TodoEntry {
        indent,
        checkbox,
        task_id,
        description: description_words.join(" "),
        assignee,
        started,
        completed,
        tags,
        issue_ref,
    })
}

/// Render a `TodoEntry` back to its `TODO.md` line form.
pub fn render_line(entry: &TodoEntry) -> String {
    let mut line = format!(
        "{}- [{}] {} {}",
        " ".repeat(entry.indent),
        entry.checkbox.marker(),
        entry.task_id,
        entry.description
    );
    if let Some(a) = &entry.assignee {
        let _ = write!(line, " assignee:{a}");
    }
    if let Some(s) = &entry.started {
        let _ = write!(line, " started:{s}");
    }
    if let Some(c) = &entry.completed {
        let _ = write!(line, " completed:{c}");
    }
    for tag in &entry.tags {
        let _ = write!(line, " #{tag}");
    }
    if let Some(r) = &entry.issue_ref {
        let _ = write!(line, " ref:{r}");
    }
    line
}

/// Set `assignee:<identity>` on the line for `task_id`. Returns the new
/// file content, or `None` if the task line wasn't found.
pub fn claim(content: &str, task_id: &str, identity: &str) -> Option<String> {
    mutate_entry(content, task_id, |entry| {
        entry.assignee = Some(identity.to_string());
    })
}

/// Clear the `assignee:` field for `task_id` (claim lost or released).
pub fn unclaim(content: &str, task_id: &str) -> Option<String> {
    mutate_entry(content, task_id, |entry| {
        entry.assignee = None;
    })
}

/// Flip `[ ] -> [x]` with `completed:<today>` on deployment.
pub fn mark_done(content: &str, task_id: &str) -> Option<String> {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    mutate_entry(content, task_id, |entry| {
        entry.checkbox = Checkbox::Done;
        entry.completed = Some(today.clone());
        entry.assignee = None;
    })
}

/// Append an indented `- Notes: BLOCKED: <reason>` line under `task_id`'s
/// entry on block/fail.
pub fn annotate_blocked(content: &str, task_id: &str, reason: &str) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let idx = lines
        .iter()
        .position(|l| parse_line(l).is_some_and(|e| e.task_id == task_id))?;
    let indent = parse_line(&lines[idx]).map(|e| e.indent).unwrap_or(0);
    let note = format!("{}  - Notes: BLOCKED: {reason}", " ".repeat(indent));
    lines.insert(idx + 1, note);
    Some(lines.join("\n") + "\n")
}

fn mutate_entry(content: &str, task_id: &str, f: impl FnOnce(&mut TodoEntry)) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let idx = lines
        .iter()
        .position(|l| parse_line(l).is_some_and(|e| e.task_id == task_id))?;
    let mut entry = parse_line(&lines[idx])?;
    f(&mut entry);
    lines[idx] = render_line(&entry);
    Some(lines.join("\n") + "\n")
}

/// Commit `TODO.md` and push with pull-rebase retry (§6, §9): up to 3
/// attempts with 1-2-3s backoff. A push rejection means another worker
/// claimed first — the caller treats that as claim lost, not a hard error.
pub fn commit_and_push(repo_root: &Path, message: &str) -> bool {
    let cfg = RetryStrategyConfig::todo_push();
    for attempt in 1..=cfg.max_attempts {
        let add = run_with_timeout("git", &["add", "TODO.md"], repo_root, None);
        let commit = run_with_timeout("git", &["commit", "-m", message], repo_root, None);
        if add.is_err() || commit.is_err() {
            return false;
        }
        let push = run_with_timeout("git", &["push"], repo_root, None);
        match push {
            Ok(out) if out.exit_code == 0 => return true,
            _ => {
                let _ = run_with_timeout("git", &["pull", "--rebase"], repo_root, None);
                if attempt < cfg.max_attempts {
                    std::thread::sleep(calculate_delay(&cfg, attempt));
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_extracts_all_fields() {
        let line = "  - [ ] t001 Add retry logic assignee:alice started:2026-01-01 #backend ref:GH#42";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.indent, 2);
        assert_eq!(entry.task_id, "t001");
        assert_eq!(entry.description, "Add retry logic");
        assert_eq!(entry.assignee, Some("alice".to_string()));
        assert_eq!(entry.started, Some("2026-01-01".to_string()));
        assert_eq!(entry.tags, vec!["backend"]);
        assert_eq!(entry.issue_ref, Some("GH#42".to_string()));
    }

    #[test]
    fn parse_line_rejects_non_task_lines() {
        assert!(parse_line("# My TODO list").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn render_line_round_trips_parse() {
        let line = "- [ ] t001 Add retry logic assignee:alice #backend";
        let entry = parse_line(line).unwrap();
        let rendered = render_line(&entry);
        let reparsed = parse_line(&rendered).unwrap();
        assert_eq!(entry, reparsed);
    }

    #[test]
    fn claim_sets_assignee() {
        let content = "- [ ] t001 Add retry logic\n- [ ] t002 Other\n";
        let updated = claim(content, "t001", "alice@host").unwrap();
        assert!(updated.contains("assignee:alice@host"));
        assert!(updated.contains("t002 Other"));
    }

    #[test]
    fn mark_done_flips_checkbox_and_clears_assignee() {
        let content = "- [ ] t001 Add retry logic assignee:alice\n";
        let updated = mark_done(content, "t001").unwrap();
        assert!(updated.starts_with("- [x] t001 Add retry logic completed:"));
        assert!(!updated.contains("assignee:"));
    }

    #[test]
    fn annotate_blocked_inserts_indented_note() {
        let content = "- [ ] t001 Add retry logic\n- [ ] t002 Other\n";
        let updated = annotate_blocked(content, "t001", "auth_error").unwrap();
        let lines: Vec<&str> = updated.lines().collect();
        assert_eq!(lines[1], "  - Notes: BLOCKED: auth_error");
        assert_eq!(lines[2], "- [ ] t002 Other");
    }

    #[test]
    fn claim_returns_none_for_unknown_task() {
        let content = "- [ ] t001 Add retry logic\n";
        assert!(claim(content, "t999", "alice").is_none());
    }
}
