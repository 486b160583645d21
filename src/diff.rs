/// Closure diff post-processing: change statistics and the commit message.
use crate::term::strip_color;
use regex::Regex;
use std::sync::LazyLock;

/// Any nvd change marker such as `[U.]` or `[A*]`.
static CHANGE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.+\]").unwrap());

static ADDED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[A.\]").unwrap());
static REMOVED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[R.\]").unwrap());
static UPGRADED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[U.\]").unwrap());
static DOWNGRADED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[D.\]").unwrap());
static CHANGED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[C.\]").unwrap());

/// Package change counts from a closure diff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeStats {
    pub added: usize,
    pub removed: usize,
    pub upgraded: usize,
    pub downgraded: usize,
    pub changed: usize,
}

impl ChangeStats {
    pub fn count(diff: &str) -> Self {
        let plain = strip_color(diff);
        Self {
            added: ADDED.find_iter(&plain).count(),
            removed: REMOVED.find_iter(&plain).count(),
            upgraded: UPGRADED.find_iter(&plain).count(),
            downgraded: DOWNGRADED.find_iter(&plain).count(),
            changed: CHANGED.find_iter(&plain).count(),
        }
    }

    pub fn total(&self) -> usize {
        self.added + self.removed + self.upgraded + self.downgraded + self.changed
    }

    /// One-line summary for the upgrade prompt.
    pub fn summary(&self) -> String {
        if self.total() == 0 {
            return "Config changes found".to_string();
        }
        let parts: Vec<String> = [
            (self.added, "added"),
            (self.removed, "removed"),
            (self.upgraded, "upgraded"),
            (self.downgraded, "downgraded"),
            (self.changed, "changed"),
        ]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
        format!("{} package changes: {}", self.total(), parts.join(", "))
    }
}

/// Whether the diff lists package changes rather than only config changes.
pub fn has_package_changes(diff: &str) -> bool {
    CHANGE_MARKER.is_match(diff)
}

/// Drop the two header lines nvd prints before the changes.
pub fn strip_header(diff: &str) -> String {
    diff.split('\n').skip(2).collect::<Vec<_>>().join("\n")
}

/// Commit message for the flake repository.
pub fn commit_message(program: &str, user_message: &str, diff: &str) -> String {
    let mut msg = format!("{program}: Auto commit\n\n");
    if !user_message.is_empty() {
        msg.push_str(user_message);
        msg.push_str("\n\n");
    }
    msg.push_str(&strip_color(diff));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
<<< /run/current-system
>>> /nix/store/abc-nixos-system
Version changes:
[U.]  #1  firefox  120.0 -> 121.0
[U*]  #2  linux  6.6.1 -> 6.6.2
Added packages:
[A.]  #1  ripgrep  14.0.3
Removed packages:
[R.]  #1  grep  3.11
Closure size: 1500 -> 1501 (12 paths added, 10 paths removed, delta +2).";

    #[test]
    fn test_count_changes() {
        let stats = ChangeStats::count(DIFF);
        assert_eq!(
            stats,
            ChangeStats {
                added: 1,
                removed: 1,
                upgraded: 2,
                downgraded: 0,
                changed: 0
            }
        );
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn test_count_ignores_color() {
        let colored = "\x1b[1m[\x1b[32mA\x1b[0m.]\x1b[0m  #1  hello";
        assert_eq!(ChangeStats::count(colored).added, 1);
    }

    #[test]
    fn test_summary_lists_non_zero_counts() {
        let stats = ChangeStats::count(DIFF);
        assert_eq!(
            stats.summary(),
            "4 package changes: 1 added, 1 removed, 2 upgraded"
        );
    }

    #[test]
    fn test_summary_without_package_changes() {
        assert_eq!(ChangeStats::default().summary(), "Config changes found");
    }

    #[test]
    fn test_has_package_changes() {
        assert!(has_package_changes(DIFF));
        assert!(!has_package_changes(
            "<<< a\n>>> b\nClosure size: 1 -> 1 (1 paths added, 1 paths removed, delta +0)."
        ));
    }

    #[test]
    fn test_strip_header() {
        assert!(strip_header(DIFF).starts_with("Version changes:\n"));
        assert_eq!(strip_header("only one line"), "");
    }

    #[test]
    fn test_commit_message_with_user_message() {
        let msg = commit_message("nixos-upgrade", "bump inputs", "\x1b[32m[A.]\x1b[0m hello");
        assert_eq!(msg, "nixos-upgrade: Auto commit\n\nbump inputs\n\n[A.] hello");
    }

    #[test]
    fn test_commit_message_without_user_message() {
        let msg = commit_message("nixos-upgrade", "", "diff");
        assert_eq!(msg, "nixos-upgrade: Auto commit\n\ndiff");
    }
}
