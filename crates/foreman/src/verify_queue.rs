//! `todo/VERIFY.md` adapter (§4.8 `verifying`, §6): a queue of
//! post-deploy directives, one entry per deployed task, run by the
//! `verifying` phase before a task reaches `verified`. Shares the
//! line-oriented parsing style of [`crate::todo_registry`] rather than a
//! Markdown AST, for the same reason: the file is a flat append-log, not a
//! document to be round-tripped structurally.

use std::path::Path;
use std::time::Duration;

use foreman_process::run_with_timeout;

/// One parsed `VERIFY.md` entry: `- [ ] <task_id> directive:<kind> <arg>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEntry {
    pub task_id: String,
    pub directive: Directive,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    FileExists(String),
    Shellcheck(String),
    Grep(String),
    Bash(String),
}

impl Directive {
    fn parse(kind: &str, arg: &str) -> Option<Self> {
        Some(match kind {
            "file-exists" => Directive::FileExists(arg.to_string()),
            "shellcheck" => Directive::Shellcheck(arg.to_string()),
            "rg" => Directive::Grep(arg.to_string()),
            "bash" => Directive::Bash(arg.to_string()),
            _ => return None,
        })
    }

    fn render(&self) -> String {
        match self {
            Directive::FileExists(p) => format!("directive:file-exists {p}"),
            Directive::Shellcheck(p) => format!("directive:shellcheck {p}"),
            Directive::Grep(p) => format!("directive:rg {p}"),
            Directive::Bash(p) => format!("directive:bash {p}"),
        }
    }
}

/// Parse a single `VERIFY.md` line into a [`VerifyEntry`].
pub fn parse_line(line: &str) -> Option<VerifyEntry> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("- [")?;
    let (marker, rest) = rest.split_at(1);
    let done = marker == "x" || marker == "X";
    let rest = rest.strip_prefix("] ")?;

    let mut fields = rest.split(' ');
    let task_id = fields.next()?.to_string();
    let directive_field = fields.next()?;
    let kind = directive_field.strip_prefix("directive:")?;
    let arg = fields.collect::<Vec<_>>().join(" ");
    let directive = Directive::parse(kind, &arg)?;

    Some(VerifyEntry { task_id, directive, done })
}

/// Parse the full `VERIFY.md` content into entries, skipping non-entry
/// lines (headers, blank lines) silently.
pub fn parse_all(content: &str) -> Vec<VerifyEntry> {
    content.lines().filter_map(parse_line).collect()
}

/// Sentinel marking the end of the live queue (§6): new entries are inserted
/// before it rather than appended to end-of-file, so a trailing
/// commentary/footer section in `VERIFY.md` never ends up split by a queue
/// entry landing after it.
pub const QUEUE_END_SENTINEL: &str = "<!-- VERIFY-QUEUE-END -->";

/// Insert a new entry for a just-deployed task, just before
/// [`QUEUE_END_SENTINEL`] if present, or at end-of-file otherwise.
pub fn append_entry(content: &str, task_id: &str, directive: Directive) -> String {
    let line = format!("- [ ] {task_id} {}", directive.render());

    if let Some(pos) = content.find(QUEUE_END_SENTINEL) {
        let (before, after) = content.split_at(pos);
        let mut out = before.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&line);
        out.push('\n');
        out.push_str(after);
        return out;
    }

    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&line);
    out.push('\n');
    out
}

/// Flip an entry's checkbox to done once its directive passed.
pub fn mark_verified(content: &str, task_id: &str) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let idx = lines.iter().position(|l| {
        parse_line(l).is_some_and(|e| e.task_id == task_id)
    })?;
    let entry = parse_line(&lines[idx])?;
    lines[idx] = format!("- [x] {} {}", entry.task_id, entry.directive.render());
    Some(lines.join("\n") + "\n")
}

/// The outcome of running one directive against the deployed repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Passed,
    Failed { detail: String },
}

/// Run a single directive, matching the small fixed vocabulary in §6: the
/// directive grammar is intentionally not Turing-complete beyond `bash`,
/// which is the deliberate escape hatch for anything else.
pub fn run_directive(repo_root: &Path, directive: &Directive, timeout: Duration) -> VerifyResult {
    match directive {
        Directive::FileExists(rel_path) => {
            if repo_root.join(rel_path).exists() {
                VerifyResult::Passed
            } else {
                VerifyResult::Failed { detail: format!("{rel_path} does not exist") }
            }
        }
        Directive::Shellcheck(rel_path) => run_and_check("shellcheck", &[rel_path.as_str()], repo_root, timeout),
        Directive::Grep(pattern) => run_and_check("rg", &[pattern.as_str()], repo_root, timeout),
        Directive::Bash(script) => run_and_check("bash", &["-c", script.as_str()], repo_root, timeout),
    }
}

fn run_and_check(program: &str, args: &[&str], repo_root: &Path, timeout: Duration) -> VerifyResult {
    match run_with_timeout(program, args, repo_root, Some(timeout)) {
        Ok(out) if out.exit_code == 0 => VerifyResult::Passed,
        Ok(out) => VerifyResult::Failed {
            detail: format!("{program} exited {}: {}", out.exit_code, out.stderr.trim()),
        },
        Err(e) => VerifyResult::Failed { detail: e.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_handles_file_exists_directive() {
        let entry = parse_line("- [ ] t001 directive:file-exists src/lib.rs").unwrap();
        assert_eq!(entry.task_id, "t001");
        assert_eq!(entry.directive, Directive::FileExists("src/lib.rs".to_string()));
        assert!(!entry.done);
    }

    #[test]
    fn parse_line_handles_bash_directive_with_spaces() {
        let entry = parse_line("- [ ] t002 directive:bash echo hi && exit 0").unwrap();
        assert_eq!(entry.directive, Directive::Bash("echo hi && exit 0".to_string()));
    }

    #[test]
    fn parse_line_marks_done_from_x_checkbox() {
        let entry = parse_line("- [x] t003 directive:file-exists README.md").unwrap();
        assert!(entry.done);
    }

    #[test]
    fn append_entry_adds_newline_separated_line() {
        let content = "- [ ] t001 directive:file-exists a.rs\n";
        let updated = append_entry(content, "t002", Directive::Grep("fn main".to_string()));
        assert_eq!(
            updated,
            "- [ ] t001 directive:file-exists a.rs\n- [ ] t002 directive:rg fn main\n"
        );
    }

    #[test]
    fn append_entry_inserts_before_sentinel_rather_than_appending() {
        let content = format!(
            "- [ ] t001 directive:file-exists a.rs\n{}\n## Notes\nsee runbook\n",
            QUEUE_END_SENTINEL
        );
        let updated = append_entry(&content, "t002", Directive::Grep("fn main".to_string()));
        let sentinel_pos = updated.find(QUEUE_END_SENTINEL).unwrap();
        let new_entry_pos = updated.find("t002").unwrap();
        assert!(new_entry_pos < sentinel_pos);
        assert!(updated.ends_with("## Notes\nsee runbook\n"));
    }

    #[test]
    fn mark_verified_flips_only_matching_entry() {
        let content = "- [ ] t001 directive:file-exists a.rs\n- [ ] t002 directive:file-exists b.rs\n";
        let updated = mark_verified(content, "t001").unwrap();
        let entries = parse_all(&updated);
        assert!(entries[0].done);
        assert!(!entries[1].done);
    }

    #[test]
    fn parse_all_skips_non_entry_lines() {
        let content = "# Verify queue\n\n- [ ] t001 directive:file-exists a.rs\n";
        let entries = parse_all(content);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn run_directive_file_exists_checks_relative_to_repo_root() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("marker.txt"), "x").unwrap();
        let result = run_directive(td.path(), &Directive::FileExists("marker.txt".to_string()), Duration::from_secs(5));
        assert_eq!(result, VerifyResult::Passed);
    }

    #[test]
    fn run_directive_file_exists_fails_for_missing_file() {
        let td = tempfile::tempdir().unwrap();
        let result = run_directive(td.path(), &Directive::FileExists("nope.txt".to_string()), Duration::from_secs(5));
        assert!(matches!(result, VerifyResult::Failed { .. }));
    }
}
