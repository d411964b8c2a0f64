//! Local process scanning.
//!
//! Builds the snapshot the daemon reconciles: every process whose executable
//! path looks like a development tool, keyed by pid and start time.

use once_cell::sync::Lazy;
use proctrack_protocol::ProcessObservation;
use regex::RegexSet;
use std::path::Path;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

/// Substrings of executable paths that mark a development tool.
pub const DEV_TOOL_INDICATORS: [&str; 16] = [
    "vscode",
    "Code.app",
    "cpptools",
    "Terminal.app",
    "iterm",
    "clang",
    "gcc",
    "cmake",
    "ninja",
    "python",
    "node",
    "cargo",
    "anaconda",
    "miniconda",
    "bin/git",
    "bin/make",
];

static DEV_TOOLS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(DEV_TOOL_INDICATORS.iter().map(|indicator| regex::escape(indicator))).unwrap()
});

pub enum ProcessFilter {
    All,
    DevTools,
    Patterns(RegexSet),
}

impl ProcessFilter {
    /// Development tools plus any extra user patterns.
    pub fn with_patterns(patterns: &[String]) -> Result<Self, regex::Error> {
        if patterns.is_empty() {
            return Ok(ProcessFilter::DevTools);
        }
        let all = DEV_TOOL_INDICATORS
            .iter()
            .map(|indicator| regex::escape(indicator))
            .chain(patterns.iter().cloned());
        Ok(ProcessFilter::Patterns(RegexSet::new(all)?))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            ProcessFilter::All => true,
            ProcessFilter::DevTools => DEV_TOOLS.is_match(path),
            ProcessFilter::Patterns(set) => set.is_match(path),
        }
    }
}

pub struct ProcessScanner {
    system: System,
    filter: ProcessFilter,
}

impl ProcessScanner {
    pub fn new(filter: ProcessFilter) -> Self {
        Self {
            system: System::new(),
            filter,
        }
    }

    pub fn scan(&mut self) -> Vec<ProcessObservation> {
        self.system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );

        let mut observations: Vec<ProcessObservation> = self
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let exe = process.exe()?;
                observation_for(pid.as_u32(), exe, process.name(), process.start_time())
            })
            .filter(|observation| self.filter.matches(&observation.path))
            .collect();

        observations.sort_by_key(|observation| observation.identity());
        observations
    }
}

fn observation_for(
    pid: u32,
    exe: &Path,
    fallback_name: &str,
    start_time: u64,
) -> Option<ProcessObservation> {
    if pid == 0 {
        return None;
    }
    let path = exe.to_string_lossy().to_string();
    if path.trim().is_empty() {
        return None;
    }
    let name = exe
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| fallback_name.to_string());
    if name.trim().is_empty() {
        return None;
    }

    Some(ProcessObservation {
        pid,
        name,
        path,
        start_time: i64::try_from(start_time).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_tool_filter_matches_known_tools() {
        let filter = ProcessFilter::DevTools;
        assert!(filter.matches("/Users/me/.cargo/bin/cargo"));
        assert!(filter.matches("/Applications/Visual Studio Code.app/Contents/MacOS/Electron"));
        assert!(filter.matches("/usr/bin/git"));
        assert!(filter.matches("/opt/homebrew/bin/python3.12"));
        assert!(!filter.matches("/usr/sbin/cron"));
    }

    #[test]
    fn indicators_are_literal_substrings() {
        // "Code.app" must not behave like a regex with a wildcard dot.
        assert!(!ProcessFilter::DevTools.matches("/Applications/CodeXapp/bin/run"));
    }

    #[test]
    fn extra_patterns_extend_defaults() {
        let filter = ProcessFilter::with_patterns(&["^/opt/tools/".to_string()]).expect("filter");
        assert!(filter.matches("/opt/tools/linter"));
        assert!(filter.matches("/usr/bin/node"));
        assert!(!filter.matches("/usr/sbin/cron"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(ProcessFilter::with_patterns(&["(unclosed".to_string()]).is_err());
    }

    #[test]
    fn all_filter_matches_everything() {
        assert!(ProcessFilter::All.matches("/usr/sbin/cron"));
    }

    #[test]
    fn observation_uses_last_path_component_as_name() {
        let observation =
            observation_for(42, Path::new("/usr/local/bin/node"), "node-fallback", 1_700_000_000)
                .expect("observation");
        assert_eq!(observation.name, "node");
        assert_eq!(observation.path, "/usr/local/bin/node");
        assert_eq!(observation.start_time, 1_700_000_000);
        assert!(observation.validate().is_ok());
    }

    #[test]
    fn observation_skips_pid_zero_and_empty_paths() {
        assert!(observation_for(0, Path::new("/sbin/launchd"), "launchd", 1).is_none());
        assert!(observation_for(7, Path::new(""), "", 1).is_none());
    }

    #[test]
    fn scanner_reports_valid_observations() {
        let mut scanner = ProcessScanner::new(ProcessFilter::All);
        let observations = scanner.scan();
        for observation in &observations {
            assert!(observation.validate().is_ok(), "{:?}", observation);
        }
        let mut identities: Vec<_> = observations.iter().map(|o| o.identity()).collect();
        let before = identities.len();
        identities.dedup();
        assert_eq!(identities.len(), before);
    }
}
