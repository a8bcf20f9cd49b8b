//! Test discovery and filtering.
//!
//! Tests live at `suites/<use_case>/<test_case>/test.yaml`; the path yields
//! the test id, the YAML yields its name and tags. Discovery output is
//! sorted lexicographically by test id so scheduling order is stable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{ConfigResult, TestSpec};

/// One discovered test
#[derive(Debug, Clone)]
pub struct DiscoveredTest {
    /// `use_case/test_case`
    pub test_id: String,
    pub use_case: String,
    pub test_case: String,
    pub name: String,
    pub tags: Vec<String>,
    /// Absolute path to test.yaml
    pub path: PathBuf,
}

/// Test selection filters applied before scheduling.
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    /// Use-case names; empty matches all
    pub use_cases: BTreeSet<String>,
    /// Test cases: bare `tcNN` substring-matches the test-case segment,
    /// `uc/tc` matches the full id exactly
    pub test_cases: BTreeSet<String>,
    /// Tags; a test matches when it carries any of them
    pub tags: BTreeSet<String>,
}

impl TestFilter {
    pub fn is_empty(&self) -> bool {
        self.use_cases.is_empty() && self.test_cases.is_empty() && self.tags.is_empty()
    }

    pub fn matches(&self, test: &DiscoveredTest) -> bool {
        if !self.use_cases.is_empty() && !self.use_cases.contains(&test.use_case) {
            return false;
        }
        if !self.test_cases.is_empty() {
            let hit = self.test_cases.iter().any(|pattern| {
                if pattern.contains('/') {
                    pattern == &test.test_id
                } else {
                    test.test_case.contains(pattern.as_str())
                }
            });
            if !hit {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| test.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Walk `suites/*/*/test.yaml` under a suite directory.
///
/// Unreadable test files are logged and skipped; a missing `suites/`
/// directory yields an empty list.
pub fn discover_tests(suite_path: &Path) -> Vec<DiscoveredTest> {
    let suites_dir = suite_path.join("suites");
    let mut tests = Vec::new();

    let use_cases = match std::fs::read_dir(&suites_dir) {
        Ok(entries) => entries,
        Err(_) => {
            debug!(path = %suites_dir.display(), "no suites directory");
            return tests;
        }
    };

    for uc_entry in use_cases.flatten() {
        let uc_path = uc_entry.path();
        if !uc_path.is_dir() {
            continue;
        }
        let use_case = uc_entry.file_name().to_string_lossy().into_owned();

        let Ok(test_cases) = std::fs::read_dir(&uc_path) else {
            continue;
        };
        for tc_entry in test_cases.flatten() {
            let tc_path = tc_entry.path();
            let yaml_path = tc_path.join("test.yaml");
            if !tc_path.is_dir() || !yaml_path.is_file() {
                continue;
            }
            let test_case = tc_entry.file_name().to_string_lossy().into_owned();
            let test_id = format!("{use_case}/{test_case}");

            match TestSpec::load(&yaml_path) {
                Ok(spec) => tests.push(DiscoveredTest {
                    test_id,
                    use_case: use_case.clone(),
                    test_case,
                    name: if spec.name.is_empty() {
                        tc_entry.file_name().to_string_lossy().into_owned()
                    } else {
                        spec.name
                    },
                    tags: spec.tags,
                    path: yaml_path,
                }),
                Err(e) => {
                    warn!(test_id, error = %e, "skipping unparseable test.yaml");
                }
            }
        }
    }

    tests.sort_by(|a, b| a.test_id.cmp(&b.test_id));
    tests
}

/// Discover and filter in one pass.
pub fn discover_filtered(suite_path: &Path, filter: &TestFilter) -> Vec<DiscoveredTest> {
    discover_tests(suite_path)
        .into_iter()
        .filter(|t| filter.matches(t))
        .collect()
}

/// Validate every test and routine file in a suite without executing.
///
/// Returns human-readable problems; an empty list means the suite is sound.
pub fn check_suite(suite_path: &Path) -> ConfigResult<Vec<String>> {
    use crate::config::{RoutineFile, StepKind, SuiteConfig};

    let mut problems = Vec::new();
    let config = SuiteConfig::load(suite_path)?;
    if config.defaults.parallel.is_some() {
        problems.push(
            "defaults.parallel is deprecated and ignored; use execution.max_workers".to_string(),
        );
    }

    let global = RoutineFile::load(&suite_path.join("global/routines.yaml"))?;
    let tests = discover_tests(suite_path);

    for test in &tests {
        let spec = match TestSpec::load(&test.path) {
            Ok(spec) => spec,
            Err(e) => {
                problems.push(format!("{}: {e}", test.test_id));
                continue;
            }
        };
        let uc_routines = RoutineFile::load(
            &suite_path
                .join("suites")
                .join(&test.use_case)
                .join("routines.yaml"),
        )?;

        for phase in crate::config::Phase::ALL {
            for (index, step) in spec.phase_steps(phase).iter().enumerate() {
                match step.kind() {
                    None => problems.push(format!(
                        "{}: {phase}[{index}] has neither handler nor routine",
                        test.test_id
                    )),
                    Some(StepKind::Routine(name)) => {
                        let resolved = if let Some(bare) = name.strip_prefix("global.") {
                            global.get(bare).is_some()
                        } else {
                            uc_routines.get(name).is_some() || global.get(name).is_some()
                        };
                        if !resolved {
                            problems.push(format!(
                                "{}: {phase}[{index}] references unknown routine '{name}'",
                                test.test_id
                            ));
                        }
                    }
                    Some(StepKind::Handler(_)) => {}
                }
            }
        }
    }

    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test(root: &Path, uc: &str, tc: &str, yaml: &str) {
        let dir = root.join("suites").join(uc).join(tc);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("test.yaml"), yaml).unwrap();
    }

    fn scaffold() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_test(
            dir.path(),
            "uc1",
            "tc01",
            "name: first\ntags: [smoke]\ntest:\n  - handler: shell\n    command: echo hi\n",
        );
        write_test(
            dir.path(),
            "uc1",
            "tc02",
            "name: second\ntags: [slow]\ntest: []\n",
        );
        write_test(
            dir.path(),
            "uc2",
            "tc01",
            "name: third\ntags: [smoke, slow]\ntest: []\n",
        );
        dir
    }

    #[test]
    fn test_discovery_sorted_by_id() {
        let dir = scaffold();
        let tests = discover_tests(dir.path());
        let ids: Vec<&str> = tests.iter().map(|t| t.test_id.as_str()).collect();
        assert_eq!(ids, vec!["uc1/tc01", "uc1/tc02", "uc2/tc01"]);
        assert_eq!(tests[0].name, "first");
        assert_eq!(tests[0].tags, vec!["smoke"]);
    }

    #[test]
    fn test_missing_suites_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_tests(dir.path()).is_empty());
    }

    #[test]
    fn test_use_case_filter() {
        let dir = scaffold();
        let filter = TestFilter {
            use_cases: ["uc1".to_string()].into(),
            ..Default::default()
        };
        let tests = discover_filtered(dir.path(), &filter);
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|t| t.use_case == "uc1"));
    }

    #[test]
    fn test_test_case_filter_bare_and_qualified() {
        let dir = scaffold();

        // Bare substring matches the tc segment in every use case
        let bare = TestFilter {
            test_cases: ["tc01".to_string()].into(),
            ..Default::default()
        };
        let tests = discover_filtered(dir.path(), &bare);
        assert_eq!(tests.len(), 2);

        // Fully qualified is exact
        let exact = TestFilter {
            test_cases: ["uc2/tc01".to_string()].into(),
            ..Default::default()
        };
        let tests = discover_filtered(dir.path(), &exact);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].test_id, "uc2/tc01");
    }

    #[test]
    fn test_tag_filter_any_match() {
        let dir = scaffold();
        let filter = TestFilter {
            tags: ["smoke".to_string()].into(),
            ..Default::default()
        };
        let tests = discover_filtered(dir.path(), &filter);
        assert_eq!(tests.len(), 2);
    }

    #[test]
    fn test_check_suite_reports_unknown_routine() {
        let dir = scaffold();
        std::fs::write(dir.path().join("config.yaml"), "suite:\n  name: s\n").unwrap();
        write_test(
            dir.path(),
            "uc3",
            "tc01",
            "name: broken\ntest:\n  - routine: does_not_exist\n",
        );
        let problems = check_suite(dir.path()).unwrap();
        assert!(problems.iter().any(|p| p.contains("does_not_exist")));
    }

    #[test]
    fn test_check_suite_flags_deprecated_parallel() {
        let dir = scaffold();
        std::fs::write(
            dir.path().join("config.yaml"),
            "suite:\n  name: s\ndefaults:\n  parallel: 2\n",
        )
        .unwrap();
        let problems = check_suite(dir.path()).unwrap();
        assert!(problems.iter().any(|p| p.contains("deprecated")));
    }
}
