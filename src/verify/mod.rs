//! Post-install verification
//!
//! Runs a recipe's `[verify]` command against an installed version and
//! checks the output. Three modes:
//!
//! - `version` (default): transform the version with `version_format`,
//!   substitute it into the pattern (default `{version}`) and require the
//!   output to contain the result;
//! - `output`: plain substring match, for tools that don't print a version;
//!   needs a `reason` explaining why;
//! - `functional`: reserved, always rejected.

pub mod version_format;

use crate::core::config::Config;
use crate::engine::state::State;
use crate::error::{StateError, VerifyError};
use crate::recipe::{Recipe, VerifySpec};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use version_format::VersionFormat;

/// Result of one command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub status: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

/// Runs verify commands. Swapped out in tests.
pub trait CommandRunner {
    fn run(&self, command: &str, install_dir: &Path) -> io::Result<CommandOutput>;
}

/// `sh -c` with `<install_dir>/bin` first on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, install_dir: &Path) -> io::Result<CommandOutput> {
        let mut paths = vec![install_dir.join("bin")];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let path = std::env::join_paths(paths).map_err(io::Error::other)?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("PATH", path)
            .output()?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status: output.status.code(),
            output: combined,
        })
    }
}

/// What a verification run saw.
#[derive(Debug)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// Output of the main command.
    pub output: String,
    /// The pattern after substitution.
    pub expected: String,
    /// The version after `version_format`, in `version` mode.
    pub transformed_version: Option<String>,
    /// Why it failed, when `passed` is false.
    pub failure: Option<VerifyError>,
}

impl VerificationOutcome {
    /// `Ok` when passed, otherwise the failure.
    pub fn into_result(self) -> Result<VerificationOutcome, VerifyError> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Version,
    Output,
}

pub struct Verifier<R = ShellRunner> {
    runner: R,
}

impl Default for Verifier<ShellRunner> {
    fn default() -> Self {
        Self::new(ShellRunner)
    }
}

impl<R: CommandRunner> Verifier<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Verify `tool@version` installed at `install_dir`.
    ///
    /// Returns `Err` when the verify section can't be run at all (bad mode, bad
    /// version, command failed to spawn). A check that runs but doesn't
    /// match comes back as an outcome with `passed = false`.
    pub fn verify(
        &self,
        tool: &str,
        version: &str,
        install_dir: &Path,
        spec: &VerifySpec,
    ) -> Result<VerificationOutcome, VerifyError> {
        let mode = match spec.mode.as_deref().unwrap_or("version") {
            "version" => Mode::Version,
            "output" => Mode::Output,
            "functional" => {
                return Err(VerifyError::FunctionalModeUnsupported {
                    tool: tool.to_string(),
                });
            }
            other => {
                return Err(VerifyError::UnknownMode {
                    tool: tool.to_string(),
                    mode: other.to_string(),
                });
            }
        };

        version_format::validate_version_string(version)?;

        let (expected, transformed) = match mode {
            Mode::Output => {
                if spec.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
                    return Err(VerifyError::MissingReason {
                        tool: tool.to_string(),
                    });
                }
                if spec.pattern.trim().is_empty() {
                    return Err(VerifyError::MissingPattern {
                        tool: tool.to_string(),
                    });
                }
                (spec.pattern.clone(), None)
            }
            Mode::Version => {
                let format = VersionFormat::from_name(spec.version_format.as_deref());
                let transformed = format.apply(version)?;
                let pattern = if spec.pattern.trim().is_empty() {
                    "{version}"
                } else {
                    spec.pattern.as_str()
                };
                (pattern.replace("{version}", &transformed), Some(transformed))
            }
        };

        let command = substitute(&spec.command, version, install_dir);
        tracing::debug!(tool, version, %command, %expected, "running verify command");
        let result = self.run(tool, version, &command, install_dir)?;

        let expected_code = spec.exit_code.unwrap_or(0);
        let failure = if result.status != Some(expected_code) {
            Some(VerifyError::ExitCode {
                tool: tool.to_string(),
                version: version.to_string(),
                command: command.clone(),
                expected: expected_code,
                actual: result.status,
            })
        } else if !result.output.contains(&expected) {
            Some(match mode {
                Mode::Version => VerifyError::VersionMismatch {
                    tool: tool.to_string(),
                    version: version.to_string(),
                    command: command.clone(),
                    expected: expected.clone(),
                    output: result.output.trim().to_string(),
                },
                Mode::Output => VerifyError::PatternNotFound {
                    tool: tool.to_string(),
                    version: version.to_string(),
                    command: command.clone(),
                    pattern: expected.clone(),
                    output: result.output.trim().to_string(),
                },
            })
        } else {
            self.run_additional(tool, version, install_dir, spec, transformed.as_deref())?
        };

        if let Some(err) = &failure {
            tracing::warn!(tool, version, error = %err, "verification failed");
        }
        Ok(VerificationOutcome {
            passed: failure.is_none(),
            output: result.output,
            expected,
            transformed_version: transformed,
            failure,
        })
    }

    fn run(
        &self,
        tool: &str,
        version: &str,
        command: &str,
        install_dir: &Path,
    ) -> Result<CommandOutput, VerifyError> {
        self.runner
            .run(command, install_dir)
            .map_err(|source| VerifyError::Command {
                tool: tool.to_string(),
                version: version.to_string(),
                command: command.to_string(),
                source,
            })
    }

    /// First failing additional check, if any.
    fn run_additional(
        &self,
        tool: &str,
        version: &str,
        install_dir: &Path,
        spec: &VerifySpec,
        transformed: Option<&str>,
    ) -> Result<Option<VerifyError>, VerifyError> {
        let shown = transformed.unwrap_or(version);
        for check in &spec.additional {
            let command = substitute(&check.command, version, install_dir);
            let result = self.run(tool, version, &command, install_dir)?;
            let expected_code = check.exit_code.unwrap_or(0);
            if result.status != Some(expected_code) {
                return Ok(Some(VerifyError::ExitCode {
                    tool: tool.to_string(),
                    version: version.to_string(),
                    command,
                    expected: expected_code,
                    actual: result.status,
                }));
            }
            let pattern = check.pattern.replace("{version}", shown);
            if !pattern.is_empty() && !result.output.contains(&pattern) {
                return Ok(Some(VerifyError::PatternNotFound {
                    tool: tool.to_string(),
                    version: version.to_string(),
                    command,
                    pattern,
                    output: result.output.trim().to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Verify the active version of an installed tool.
    pub fn verify_active(
        &self,
        config: &Config,
        state: &State,
        recipe: &Recipe,
    ) -> Result<VerificationOutcome, VerifyError> {
        let tool = recipe.name();
        let spec = recipe
            .verify
            .as_ref()
            .ok_or_else(|| VerifyError::NoVerifySection {
                tool: tool.to_string(),
            })?;
        let record = state.get(tool).ok_or_else(|| StateError::ToolNotInstalled {
            tool: tool.to_string(),
        })?;
        let version = &record.active_version;
        let install_dir: PathBuf = config.tool_dir(tool, version);
        self.verify(tool, version, &install_dir, spec)
    }
}

fn substitute(command: &str, version: &str, install_dir: &Path) -> String {
    command
        .replace("{version}", version)
        .replace("{install_dir}", &install_dir.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{ToolState, VersionState};
    use crate::recipe::AdditionalCheck;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Answers commands from a table and records what it was asked.
    #[derive(Default)]
    struct FakeRunner {
        responses: BTreeMap<String, CommandOutput>,
        seen: RefCell<Vec<String>>,
    }

    impl FakeRunner {
        fn with(mut self, command: &str, status: i32, output: &str) -> Self {
            self.responses.insert(
                command.to_string(),
                CommandOutput {
                    status: Some(status),
                    output: output.to_string(),
                },
            );
            self
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, command: &str, _install_dir: &Path) -> io::Result<CommandOutput> {
            self.seen.borrow_mut().push(command.to_string());
            self.responses
                .get(command)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such command"))
        }
    }

    fn spec(command: &str, pattern: &str) -> VerifySpec {
        VerifySpec {
            command: command.to_string(),
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    fn dir() -> PathBuf {
        PathBuf::from("/opt/tools/sample-1.4.0")
    }

    #[test]
    fn test_strip_v_scenario() {
        let runner = FakeRunner::default().with("sample --version", 0, "sample v1.4.0\n");
        let mut s = spec("sample --version", "v{version}");
        s.version_format = Some("strip_v".into());

        let outcome = Verifier::new(runner)
            .verify("sample", "1.4.0", &dir(), &s)
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.transformed_version.as_deref(), Some("1.4.0"));
        assert_eq!(outcome.expected, "v1.4.0");
    }

    #[test]
    fn test_default_pattern_is_version() {
        let runner = FakeRunner::default().with("jq --version", 0, "jq-1.7.1");
        let outcome = Verifier::new(runner)
            .verify("jq", "1.7.1", &dir(), &spec("jq --version", ""))
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.expected, "1.7.1");
    }

    #[test]
    fn test_version_mismatch() {
        let runner = FakeRunner::default().with("jq --version", 0, "jq-1.6");
        let outcome = Verifier::new(runner)
            .verify("jq", "1.7.1", &dir(), &spec("jq --version", "{version}"))
            .unwrap();
        assert!(!outcome.passed);
        assert!(matches!(
            outcome.into_result().unwrap_err(),
            VerifyError::VersionMismatch { .. }
        ));
    }

    #[test]
    fn test_exit_code_checked() {
        let runner = FakeRunner::default().with("x --version", 1, "x 1.0.0");
        let outcome = Verifier::new(runner)
            .verify("x", "1.0.0", &dir(), &spec("x --version", "{version}"))
            .unwrap();
        assert!(matches!(
            outcome.failure,
            Some(VerifyError::ExitCode { expected: 0, actual: Some(1), .. })
        ));

        let runner = FakeRunner::default().with("x --version", 1, "x 1.0.0");
        let mut s = spec("x --version", "{version}");
        s.exit_code = Some(1);
        assert!(Verifier::new(runner).verify("x", "1.0.0", &dir(), &s).unwrap().passed);
    }

    #[test]
    fn test_command_substitution() {
        let runner = FakeRunner::default().with(
            "/opt/tools/sample-1.4.0/bin/sample --print 1.4.0",
            0,
            "1.4.0",
        );
        let v = Verifier::new(runner);
        let outcome = v
            .verify(
                "sample",
                "1.4.0",
                &dir(),
                &spec("{install_dir}/bin/sample --print {version}", ""),
            )
            .unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn test_output_mode() {
        let runner = FakeRunner::default().with("tool --help", 0, "Usage: tool [OPTIONS]");
        let mut s = spec("tool --help", "Usage:");
        s.mode = Some("output".into());
        s.reason = Some("tool has no version flag".into());

        let outcome = Verifier::new(runner).verify("tool", "1.0", &dir(), &s).unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.transformed_version, None);
    }

    #[test]
    fn test_output_mode_without_reason_refused() {
        let mut s = spec("tool --help", "Usage:");
        s.mode = Some("output".into());
        let err = Verifier::new(FakeRunner::default())
            .verify("tool", "1.0", &dir(), &s)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MissingReason { .. }));

        s.reason = Some("why".into());
        s.pattern = String::new();
        let err = Verifier::new(FakeRunner::default())
            .verify("tool", "1.0", &dir(), &s)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MissingPattern { .. }));
    }

    #[test]
    fn test_functional_mode_rejected_without_running() {
        let runner = FakeRunner::default();
        let mut s = spec("tool --help", "Usage:");
        s.mode = Some("functional".into());
        let verifier = Verifier::new(runner);
        let err = verifier.verify("tool", "1.0", &dir(), &s).unwrap_err();
        assert!(matches!(err, VerifyError::FunctionalModeUnsupported { .. }));
        assert!(err.to_string().contains("output"));
        assert!(verifier.runner.seen.borrow().is_empty());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut s = spec("x", "");
        s.mode = Some("vibes".into());
        assert!(matches!(
            Verifier::new(FakeRunner::default())
                .verify("x", "1.0", &dir(), &s)
                .unwrap_err(),
            VerifyError::UnknownMode { .. }
        ));
    }

    #[test]
    fn test_unknown_format_falls_back_to_raw() {
        let runner = FakeRunner::default().with("x", 0, "x v2.0");
        let mut s = spec("x", "{version}");
        s.version_format = Some("calver".into());
        let outcome = Verifier::new(runner).verify("x", "v2.0", &dir(), &s).unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.transformed_version.as_deref(), Some("v2.0"));
    }

    #[test]
    fn test_semver_format_error_is_refusal() {
        let mut s = spec("x", "{version}");
        s.version_format = Some("semver".into());
        let err = Verifier::new(FakeRunner::default())
            .verify("x", "latest", &dir(), &s)
            .unwrap_err();
        assert!(matches!(err, VerifyError::VersionFormat { .. }));
    }

    #[test]
    fn test_additional_checks_must_all_pass() {
        let runner = FakeRunner::default()
            .with("x --version", 0, "x 1.0.0")
            .with("x-helper --version", 0, "helper 1.0.0")
            .with("x-other", 0, "nope");
        let mut s = spec("x --version", "{version}");
        s.additional = vec![
            AdditionalCheck {
                command: "x-helper --version".into(),
                pattern: "helper {version}".into(),
                exit_code: None,
            },
            AdditionalCheck {
                command: "x-other".into(),
                pattern: "yes".into(),
                exit_code: None,
            },
        ];
        let outcome = Verifier::new(runner).verify("x", "1.0.0", &dir(), &s).unwrap();
        assert!(!outcome.passed);
        match outcome.failure {
            Some(VerifyError::PatternNotFound { command, .. }) => assert_eq!(command, "x-other"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let err = Verifier::new(FakeRunner::default())
            .verify("x", "1.0", &dir(), &spec("missing", ""))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Command { .. }));
    }

    #[test]
    fn test_shell_runner_prepends_install_bin() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("hello-tool");
        std::fs::write(&script, "#!/bin/sh\necho hello-tool 3.1.4\necho warn >&2\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let out = ShellRunner.run("hello-tool", tmp.path()).unwrap();
        assert_eq!(out.status, Some(0));
        assert!(out.output.contains("hello-tool 3.1.4"));
        assert!(out.output.contains("warn"));
    }

    #[test]
    fn test_verify_active_uses_state_version() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path());
        let recipe = Recipe::parse(
            "[metadata]\nname = \"jq\"\n[verify]\ncommand = \"jq --version\"\n",
            &crate::actions::registry::ActionRegistry::builtin(),
        )
        .unwrap();

        let mut state = State::default();
        let verifier = Verifier::new(FakeRunner::default().with("jq --version", 0, "jq-1.7"));
        assert!(matches!(
            verifier.verify_active(&config, &state, &recipe).unwrap_err(),
            VerifyError::State(StateError::ToolNotInstalled { .. })
        ));

        state
            .installed
            .insert("jq".into(), ToolState::new("1.7", VersionState::new("latest")));
        assert!(verifier.verify_active(&config, &state, &recipe).unwrap().passed);
    }
}
