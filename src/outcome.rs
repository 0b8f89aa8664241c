//! Classification of `calibredb add` output.
//!
//! calibredb reports the result of an add only as free text. The detectors
//! below run in a fixed priority order and the first match wins:
//!
//! 1. stderr says the books already exist → [`CommandOutcome::DuplicateConflict`]
//! 2. stdout says `Merged book ids: …` → [`CommandOutcome::Merged`]
//! 3. stdout says `Added book ids: …` → [`CommandOutcome::Added`]
//!
//! Anything else is a [`GatewayError::Parse`]: the add may have partially
//! succeeded, so reporting success or silently continuing would both be wrong.
//!
//! The regexes are private to [`TextOutcomeClassifier`]; callers depend on
//! the [`OutcomeClassifier`] trait so a structured-output classifier can
//! replace it later.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info, warn};

use crate::error::{GatewayError, Result};
use crate::process::ProcessOutput;

static IGNORED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^The following \w+ were not added as they already exist").unwrap()
});
static MERGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Merged \w+ ids: ([0-9, ]*)").unwrap());
static ADDED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Added \w+ ids: ([0-9, ]*)").unwrap());

/// Result of one mutating calibredb invocation. Exactly one per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Added { ids: Vec<u64> },
    Merged { ids: Vec<u64> },
    DuplicateConflict { message: String },
    Failure {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

impl CommandOutcome {
    /// Ids created or merged into, empty for conflicts and failures.
    pub fn ids(&self) -> &[u64] {
        match self {
            CommandOutcome::Added { ids } | CommandOutcome::Merged { ids } => ids,
            _ => &[],
        }
    }
}

pub trait OutcomeClassifier: Send + Sync {
    /// `command` is only used to enrich errors and logs.
    fn classify(&self, command: &str, output: &ProcessOutput) -> Result<CommandOutcome>;
}

/// Regex classifier for calibredb's English text output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOutcomeClassifier;

impl OutcomeClassifier for TextOutcomeClassifier {
    fn classify(&self, command: &str, output: &ProcessOutput) -> Result<CommandOutcome> {
        if IGNORED_RE.is_match(&output.stderr) {
            let existing = output.stdout.trim_matches(|c: char| c == '\n' || c == ' ');
            info!("Books {} already exist. Ignoring...", existing);
            return Ok(CommandOutcome::DuplicateConflict {
                message: format!(
                    "Book {} already exists. Include automerge=overwrite to overwrite.",
                    existing
                ),
            });
        }

        if let Some(caps) = MERGED_RE.captures(&output.stdout) {
            let ids = parse_ids(&caps[1]);
            if ids.is_empty() {
                return Err(parse_error(command, output, "merge reported without book ids"));
            }
            info!(?ids, "Books merged");
            return Ok(CommandOutcome::Merged { ids });
        }

        if let Some(caps) = ADDED_RE.captures(&output.stdout) {
            let ids = parse_ids(&caps[1]);
            if ids.is_empty() {
                return Err(parse_error(command, output, "add reported without book ids"));
            }
            info!(?ids, "Books added");
            return Ok(CommandOutcome::Added { ids });
        }

        Err(parse_error(command, output, "no books were added"))
    }
}

fn parse_ids(list: &str) -> Vec<u64> {
    list.split(',')
        .filter_map(|id| id.trim().parse::<u64>().ok())
        .filter(|&id| id > 0)
        .collect()
}

fn parse_error(command: &str, output: &ProcessOutput, reason: &str) -> GatewayError {
    error!(
        command,
        stdout = %output.stdout,
        stderr = %output.stderr,
        "Could not interpret calibredb output: {}",
        reason
    );
    GatewayError::Parse {
        command: command.to_string(),
        reason: reason.to_string(),
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    }
}

/// How calibredb reconciles an added file that already exists in the library.
///
/// - `Ignore`: the duplicate is discarded and the add reports a conflict,
///   unless the supplied metadata differs, which creates a new record anyway.
/// - `Overwrite`: the existing file's bytes are replaced in place. If several
///   records share that file, every one of them is overwritten.
/// - `NewRecord`: always creates a separate record, even for identical bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomergeMode {
    #[default]
    Ignore,
    Overwrite,
    NewRecord,
}

impl AutomergeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutomergeMode::Ignore => "ignore",
            AutomergeMode::Overwrite => "overwrite",
            AutomergeMode::NewRecord => "new_record",
        }
    }

    /// Unknown modes fall back to `Ignore` with a warning instead of failing.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!(
                "automerge value \"{}\" not supported. Using \"--automerge=ignore\".",
                value
            );
            AutomergeMode::Ignore
        })
    }

    pub fn to_arg(self) -> String {
        format!("--automerge={}", self.as_str())
    }
}

impl FromStr for AutomergeMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ignore" => Ok(AutomergeMode::Ignore),
            "overwrite" => Ok(AutomergeMode::Overwrite),
            "new_record" => Ok(AutomergeMode::NewRecord),
            other => Err(GatewayError::validation(format!(
                "unknown automerge mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AutomergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AutomergeMode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(AutomergeMode::parse_lenient(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn classify(stdout: &str, stderr: &str) -> Result<CommandOutcome> {
        TextOutcomeClassifier.classify("calibredb add foo.epub", &output(stdout, stderr))
    }

    #[test]
    fn test_added() {
        assert_eq!(
            classify("Added book ids: 5\n", "").unwrap(),
            CommandOutcome::Added { ids: vec![5] }
        );
        assert_eq!(
            classify("Added book ids: 5, 6,7\n", "").unwrap(),
            CommandOutcome::Added { ids: vec![5, 6, 7] }
        );
    }

    #[test]
    fn test_merged() {
        assert_eq!(
            classify("Merged book ids: 3\n", "").unwrap(),
            CommandOutcome::Merged { ids: vec![3] }
        );
    }

    #[test]
    fn test_merged_takes_priority_over_added() {
        let outcome = classify("Added book ids: 9\nMerged book ids: 3\n", "").unwrap();
        assert_eq!(outcome, CommandOutcome::Merged { ids: vec![3] });
    }

    #[test]
    fn test_duplicate_wins_over_stdout() {
        let stderr = "The following books were not added as they already exist in the database \
                      (see --duplicates option or --automerge option):\n  foo\n";
        let outcome = classify("Added book ids: 9\n", stderr).unwrap();
        match outcome {
            CommandOutcome::DuplicateConflict { message } => {
                assert!(message.contains("already exists"));
                assert!(message.contains("Added book ids: 9"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_output_is_error() {
        let err = classify("Something unexpected\n", "warning").unwrap_err();
        match err {
            GatewayError::Parse {
                command,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(command, "calibredb add foo.epub");
                assert_eq!(stdout, "Something unexpected\n");
                assert_eq!(stderr, "warning");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_match_without_ids_is_error() {
        assert!(matches!(
            classify("Merged book ids: \n", ""),
            Err(GatewayError::Parse { .. })
        ));
        assert!(matches!(
            classify("Added book ids: \n", ""),
            Err(GatewayError::Parse { .. })
        ));
    }

    #[test]
    fn test_match_must_start_a_line() {
        assert!(classify("Not Added book ids: 4\n", "").is_err());
    }

    #[test]
    fn test_automerge_parse() {
        assert_eq!(AutomergeMode::parse_lenient("overwrite"), AutomergeMode::Overwrite);
        assert_eq!(AutomergeMode::parse_lenient("new_record"), AutomergeMode::NewRecord);
        assert_eq!(AutomergeMode::parse_lenient("bogus"), AutomergeMode::Ignore);
        assert!("bogus".parse::<AutomergeMode>().is_err());
        assert_eq!(AutomergeMode::NewRecord.to_arg(), "--automerge=new_record");
    }

    #[test]
    fn test_automerge_deserialize_is_lenient() {
        let mode: AutomergeMode = serde_json::from_str("\"merge_everything\"").unwrap();
        assert_eq!(mode, AutomergeMode::Ignore);
    }

    #[test]
    fn test_outcome_ids() {
        assert_eq!(CommandOutcome::Added { ids: vec![1, 2] }.ids(), &[1, 2]);
        let conflict = CommandOutcome::DuplicateConflict {
            message: String::new(),
        };
        assert!(conflict.ids().is_empty());
    }
}
