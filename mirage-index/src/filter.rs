//! Avoid-sync filter for editor temp and lock files

use std::path::Path;
use tracing::trace;

/// Decides which local entries never take part in reconciliation
pub trait SyncFilter: Send + Sync {
    fn avoid_sync(&self, path: &Path) -> bool;
}

/// Default editor/OS noise patterns
pub fn default_patterns() -> Vec<String> {
    [
        "~$*",
        ".~lock.*",
        "*.tmp",
        "*.swp",
        "*~",
        ".DS_Store",
        "Thumbs.db",
        "desktop.ini",
        ".mirage*",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Filter matching file names against simple glob patterns
#[derive(Debug, Clone)]
pub struct PatternFilter {
    patterns: Vec<String>,
}

impl PatternFilter {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for PatternFilter {
    fn default() -> Self {
        Self::new(default_patterns())
    }
}

impl SyncFilter for PatternFilter {
    fn avoid_sync(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        for pattern in &self.patterns {
            if glob_match(pattern, name) {
                trace!("Avoiding sync for {:?} (matches pattern: {})", path, pattern);
                return true;
            }
        }

        false
    }
}

/// Glob matching supporting `*` anywhere in the pattern
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let mut rest = name;
    let first = parts[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = parts[parts.len() - 1];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.tmp", "a.tmp"));
        assert!(glob_match("~$*", "~$report.docx"));
        assert!(glob_match(".~lock.*#", ".~lock.notes.odt#"));
        assert!(glob_match("*~", "notes.txt~"));
        assert!(!glob_match("*.tmp", "a.tmpx"));
        assert!(!glob_match("Thumbs.db", "thumbs.db"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn test_default_filter() {
        let filter = PatternFilter::default();
        assert!(filter.avoid_sync(Path::new("docs/~$report.docx")));
        assert!(filter.avoid_sync(Path::new("x/.DS_Store")));
        assert!(filter.avoid_sync(Path::new("edit.swp")));
        assert!(!filter.avoid_sync(Path::new("docs/report.docx")));
        assert!(!filter.avoid_sync(Path::new("")));
    }
}
