//! Recipe model and loader
//!
//! A recipe is a TOML document:
//!
//! ```toml
//! [metadata]
//! name = "ripgrep"
//! binaries = ["bin/rg"]
//!
//! [[steps]]
//! action = "download"
//! url = "https://example.com/rg-{version}-{os}-{arch}.tar.gz"
//!
//! [[steps]]
//! action = "apt_install"
//! packages = ["ripgrep"]
//! when = { linux_family = "debian" }
//!
//! [verify]
//! command = "rg --version"
//! pattern = "ripgrep {version}"
//! ```
//!
//! Loading validates every step against the [`ActionRegistry`] and computes
//! each step's [`StepAnalysis`] exactly once. A loaded [`Recipe`] is never
//! mutated afterwards.

pub mod index;
pub mod params;

use crate::actions::registry::ActionRegistry;
use crate::analysis::constraint::{self, AnalysisError, StepAnalysis, WhenClause};
use crate::error::RecipeError;
use params::Params;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Version constraint used when a declaration carries no `@version`.
pub const LATEST: &str = "latest";

/// Whether `name` can be a tool name. Tool names become directory, link and
/// lock file names, so no separators and no leading dot.
pub fn is_valid_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._+-]*$").expect("regex for tool names"))
        .is_match(name)
}

#[derive(Debug, Deserialize)]
struct RecipeToml {
    metadata: MetadataToml,
    #[serde(default)]
    steps: Vec<StepToml>,
    verify: Option<VerifySpec>,
}

#[derive(Debug, Deserialize)]
struct MetadataToml {
    name: String,
    description: Option<String>,
    homepage: Option<String>,
    #[serde(default)]
    binaries: Vec<String>,
    dependencies: Option<Vec<String>>,
    #[serde(default)]
    extra_dependencies: Vec<String>,
    runtime_dependencies: Option<Vec<String>>,
    #[serde(default)]
    extra_runtime_dependencies: Vec<String>,
    #[serde(default)]
    satisfies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StepToml {
    action: String,
    when: Option<WhenClause>,
    note: Option<String>,
    description: Option<String>,
    dependencies: Option<Vec<String>>,
    #[serde(default)]
    extra_dependencies: Vec<String>,
    runtime_dependencies: Option<Vec<String>>,
    #[serde(default)]
    extra_runtime_dependencies: Vec<String>,
    #[serde(flatten)]
    params: Params,
}

/// A dependency named in a recipe, with its version constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyDecl {
    pub name: String,
    /// A pinned version or [`LATEST`].
    pub constraint: String,
}

impl DependencyDecl {
    /// Parse `name` or `name@version`.
    pub fn parse(declaration: &str) -> Result<Self, String> {
        let declaration = declaration.trim();
        let (name, constraint) = match declaration.split_once('@') {
            Some((name, version)) => (name.trim(), version.trim()),
            None => (declaration, LATEST),
        };
        if name.is_empty() {
            return Err("empty dependency name".to_string());
        }
        if constraint.is_empty() {
            return Err("empty version after '@'".to_string());
        }
        if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '{' || c == '}') {
            return Err("dependency name contains invalid characters".to_string());
        }
        Ok(Self {
            name: name.to_string(),
            constraint: constraint.to_string(),
        })
    }

    pub fn latest(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: LATEST.to_string(),
        }
    }
}

impl fmt::Display for DependencyDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.constraint == LATEST {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.constraint)
        }
    }
}

/// Replace-or-extend declaration for one dependency kind.
///
/// `replace` is `Some` whenever the key is present, even as an empty list,
/// so an author can clear an implicit set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOverride {
    pub replace: Option<Vec<DependencyDecl>>,
    pub extend: Vec<DependencyDecl>,
}

impl DependencyOverride {
    fn parse(
        tool: &str,
        replace: Option<Vec<String>>,
        extend: Vec<String>,
    ) -> Result<Self, RecipeError> {
        let parse_all = |items: Vec<String>| -> Result<Vec<DependencyDecl>, RecipeError> {
            items
                .iter()
                .map(|item| {
                    DependencyDecl::parse(item).map_err(|reason| RecipeError::InvalidDependency {
                        tool: tool.to_string(),
                        declaration: item.clone(),
                        reason,
                    })
                })
                .collect()
        };
        Ok(Self {
            replace: replace.map(parse_all).transpose()?,
            extend: parse_all(extend)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.replace.is_none() && self.extend.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    /// Binary paths relative to the install dir, exposed on activation.
    pub binaries: Vec<String>,
    pub install_deps: DependencyOverride,
    pub runtime_deps: DependencyOverride,
    /// Ecosystem name to the alternate names this recipe satisfies.
    pub satisfies: BTreeMap<String, Vec<String>>,
}

/// One action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Position in the recipe's `[[steps]]` list.
    pub index: usize,
    pub action: String,
    pub params: Params,
    pub when: Option<WhenClause>,
    pub note: Option<String>,
    pub install_deps: DependencyOverride,
    pub runtime_deps: DependencyOverride,
    analysis: StepAnalysis,
}

impl Step {
    pub fn analysis(&self) -> &StepAnalysis {
        &self.analysis
    }

    /// Whether this step runs on `target`.
    pub fn applies_to(&self, target: &crate::core::platform::Target) -> bool {
        self.analysis.constraint.matches(target)
            && self.when.as_ref().is_none_or(|when| when.matches(target))
    }
}

/// Post-install check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySpec {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub pattern: String,
    pub mode: Option<String>,
    pub version_format: Option<String>,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub additional: Vec<AdditionalCheck>,
}

/// Extra command checked alongside the main verify command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalCheck {
    pub command: String,
    #[serde(default)]
    pub pattern: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub metadata: Metadata,
    pub steps: Vec<Step>,
    pub verify: Option<VerifySpec>,
    hash: String,
}

impl Recipe {
    /// Load and validate a recipe file.
    pub fn load(path: &Path, registry: &ActionRegistry) -> Result<Self, RecipeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let hint = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("<recipe>");
        Self::parse_named(&content, hint, registry)
    }

    /// Parse and validate recipe text.
    pub fn parse(content: &str, registry: &ActionRegistry) -> Result<Self, RecipeError> {
        Self::parse_named(content, "<recipe>", registry)
    }

    fn parse_named(
        content: &str,
        hint: &str,
        registry: &ActionRegistry,
    ) -> Result<Self, RecipeError> {
        let doc: RecipeToml = toml::from_str(content).map_err(|source| RecipeError::Parse {
            name: hint.to_string(),
            source,
        })?;

        let tool = doc.metadata.name.trim().to_string();
        if tool.is_empty() {
            return Err(RecipeError::Invalid {
                name: hint.to_string(),
                reason: "metadata.name is empty".to_string(),
            });
        }
        if !is_valid_name(&tool) {
            return Err(RecipeError::Invalid {
                name: hint.to_string(),
                reason: format!(
                    "metadata.name '{}' must match [a-z0-9][a-z0-9._+-]*",
                    tool
                ),
            });
        }

        let metadata = Metadata {
            install_deps: DependencyOverride::parse(
                &tool,
                doc.metadata.dependencies,
                doc.metadata.extra_dependencies,
            )?,
            runtime_deps: DependencyOverride::parse(
                &tool,
                doc.metadata.runtime_dependencies,
                doc.metadata.extra_runtime_dependencies,
            )?,
            name: tool.clone(),
            description: doc.metadata.description,
            homepage: doc.metadata.homepage,
            binaries: doc.metadata.binaries,
            satisfies: doc.metadata.satisfies,
        };

        let steps = doc
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| build_step(&tool, index, step, registry))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(verify) = &doc.verify {
            validate_verify(&tool, verify)?;
        }

        Ok(Self {
            metadata,
            steps,
            verify: doc.verify,
            hash: hex::encode(Sha256::digest(content.as_bytes())),
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// SHA-256 of the recipe document, hex encoded.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

fn build_step(
    tool: &str,
    index: usize,
    raw: StepToml,
    registry: &ActionRegistry,
) -> Result<Step, RecipeError> {
    let spec = registry
        .get(&raw.action)
        .ok_or_else(|| RecipeError::UnknownAction {
            tool: tool.to_string(),
            step: index,
            action: raw.action.clone(),
        })?;

    let when = raw.when.filter(|w| !w.is_empty());
    let analysis = constraint::analyze(&spec.constraint, when.as_ref(), &raw.params).map_err(
        |err| match err {
            AnalysisError::InvalidWhen(reason) => RecipeError::InvalidWhen {
                tool: tool.to_string(),
                step: index,
                action: raw.action.clone(),
                reason,
            },
            AnalysisError::Conflict(reason) => RecipeError::ConstraintConflict {
                tool: tool.to_string(),
                step: index,
                action: raw.action.clone(),
                reason,
            },
        },
    )?;

    let note = raw.note.or(raw.description);
    Ok(Step {
        index,
        install_deps: DependencyOverride::parse(tool, raw.dependencies, raw.extra_dependencies)?,
        runtime_deps: DependencyOverride::parse(
            tool,
            raw.runtime_dependencies,
            raw.extra_runtime_dependencies,
        )?,
        action: raw.action,
        params: raw.params,
        when,
        note,
        analysis,
    })
}

/// Authoring-time checks on the verify section.
fn validate_verify(tool: &str, verify: &VerifySpec) -> Result<(), RecipeError> {
    let invalid = |reason: &str| RecipeError::InvalidVerify {
        tool: tool.to_string(),
        reason: reason.to_string(),
    };

    if verify.command.trim().is_empty() {
        return Err(invalid("command is required"));
    }
    match verify.mode.as_deref().unwrap_or("version") {
        "version" | "functional" => {}
        "output" => {
            if verify.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
                return Err(invalid("mode = \"output\" requires a non-empty reason"));
            }
            if verify.pattern.trim().is_empty() {
                return Err(invalid("mode = \"output\" requires a pattern"));
            }
        }
        other => {
            return Err(invalid(&format!(
                "unknown mode '{}' (expected version, output or functional)",
                other
            )));
        }
    }
    if verify.additional.iter().any(|a| a.command.trim().is_empty()) {
        return Err(invalid("additional checks need a command"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::constraint::Constraint;
    use crate::core::platform::Target;
    use params::ParamValue;

    const SAMPLE: &str = r#"
[metadata]
name = "sample"
description = "A sample tool"
binaries = ["bin/sample"]
runtime_dependencies = ["libfoo@2.0"]
extra_dependencies = ["make"]

[metadata.satisfies]
npm = ["sample-cli"]

[[steps]]
action = "download"
url = "https://example.com/{version}/sample-{os}-{arch}.tar.gz"
checksum = "abc"

[[steps]]
action = "apt_install"
packages = ["sample"]
note = "system package"
extra_runtime_dependencies = ["zlib"]

[[steps]]
action = "run_command"
command = "echo {linux_family}"
when = { os = ["linux"] }

[verify]
command = "sample --version"
pattern = "v{version}"
version_format = "strip_v"
"#;

    fn registry() -> ActionRegistry {
        ActionRegistry::builtin()
    }

    #[test]
    fn test_parse_sample() {
        let recipe = Recipe::parse(SAMPLE, &registry()).unwrap();
        assert_eq!(recipe.name(), "sample");
        assert_eq!(recipe.steps.len(), 3);
        assert_eq!(recipe.metadata.binaries, vec!["bin/sample"]);
        assert_eq!(
            recipe.metadata.satisfies.get("npm"),
            Some(&vec!["sample-cli".to_string()])
        );
        assert_eq!(recipe.verify.as_ref().unwrap().pattern, "v{version}");
    }

    #[test]
    fn test_step_keys_are_not_params() {
        let recipe = Recipe::parse(SAMPLE, &registry()).unwrap();
        let apt = &recipe.steps[1];
        assert_eq!(apt.note.as_deref(), Some("system package"));
        assert!(!apt.params.contains_key("note"));
        assert!(!apt.params.contains_key("extra_runtime_dependencies"));
        assert_eq!(apt.runtime_deps.extend, vec![DependencyDecl::latest("zlib")]);
        assert_eq!(
            apt.params["packages"],
            ParamValue::List(vec![ParamValue::from("sample")])
        );
    }

    #[test]
    fn test_metadata_dependency_overrides() {
        let recipe = Recipe::parse(SAMPLE, &registry()).unwrap();
        assert_eq!(
            recipe.metadata.runtime_deps.replace,
            Some(vec![DependencyDecl {
                name: "libfoo".into(),
                constraint: "2.0".into()
            }])
        );
        assert_eq!(recipe.metadata.install_deps.replace, None);
        assert_eq!(
            recipe.metadata.install_deps.extend,
            vec![DependencyDecl::latest("make")]
        );
    }

    #[test]
    fn test_analysis_computed_at_load() {
        let recipe = Recipe::parse(SAMPLE, &registry()).unwrap();
        assert_eq!(recipe.steps[0].analysis().constraint, Constraint::unconstrained());
        assert_eq!(recipe.steps[1].analysis().constraint, Constraint::family("debian"));
        assert!(recipe.steps[2].analysis().family_varying);
        assert!(!recipe.steps[0].analysis().family_varying);
    }

    #[test]
    fn test_applies_to() {
        let recipe = Recipe::parse(SAMPLE, &registry()).unwrap();
        let darwin = Target::new("darwin", "arm64");
        let debian = Target::new("linux", "amd64").with_family("debian");
        assert!(recipe.steps[0].applies_to(&darwin));
        assert!(!recipe.steps[1].applies_to(&darwin));
        assert!(recipe.steps[1].applies_to(&debian));
        assert!(!recipe.steps[2].applies_to(&darwin));
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = Recipe::parse(SAMPLE, &registry()).unwrap();
        let b = Recipe::parse(SAMPLE, &registry()).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        let changed = SAMPLE.replace("A sample tool", "Another tool");
        let c = Recipe::parse(&changed, &registry()).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let src = "[metadata]\nname = \"x\"\n[[steps]]\naction = \"teleport\"\n";
        let err = Recipe::parse(src, &registry()).unwrap_err();
        assert!(matches!(err, RecipeError::UnknownAction { step: 0, .. }));
    }

    #[test]
    fn test_constraint_conflict_rejected_at_load() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "apt_install"
packages = ["x"]
when = { linux_family = "rhel" }
"#;
        let err = Recipe::parse(src, &registry()).unwrap_err();
        match err {
            RecipeError::ConstraintConflict { tool, step, action, .. } => {
                assert_eq!(tool, "x");
                assert_eq!(step, 0);
                assert_eq!(action, "apt_install");
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn test_invalid_when_rejected() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "download"
url = "u"
when = { platform = ["linux/amd64"], os = ["linux"] }
"#;
        assert!(matches!(
            Recipe::parse(src, &registry()).unwrap_err(),
            RecipeError::InvalidWhen { .. }
        ));
    }

    #[test]
    fn test_malformed_dependency_rejected() {
        let src = "[metadata]\nname = \"x\"\ndependencies = [\"@1.0\"]\n";
        assert!(matches!(
            Recipe::parse(src, &registry()).unwrap_err(),
            RecipeError::InvalidDependency { .. }
        ));
    }

    #[test]
    fn test_empty_replace_is_present() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "npm_install"
package = "x"
runtime_dependencies = []
"#;
        let recipe = Recipe::parse(src, &registry()).unwrap();
        assert_eq!(recipe.steps[0].runtime_deps.replace, Some(vec![]));
    }

    #[test]
    fn test_output_mode_requires_reason() {
        let src = r#"
[metadata]
name = "x"
[verify]
command = "x --help"
pattern = "usage"
mode = "output"
"#;
        let err = Recipe::parse(src, &registry()).unwrap_err();
        assert!(err.to_string().contains("reason"));

        let ok = format!("{}reason = \"no version flag\"\n", src);
        assert!(Recipe::parse(&ok, &registry()).is_ok());
    }

    #[test]
    fn test_unknown_verify_mode_rejected() {
        let src = "[metadata]\nname = \"x\"\n[verify]\ncommand = \"x\"\nmode = \"vibes\"\n";
        assert!(matches!(
            Recipe::parse(src, &registry()).unwrap_err(),
            RecipeError::InvalidVerify { .. }
        ));
    }

    #[test]
    fn test_unknown_version_format_loads() {
        let src = "[metadata]\nname = \"x\"\n[verify]\ncommand = \"x\"\nversion_format = \"calver\"\n";
        assert!(Recipe::parse(src, &registry()).is_ok());
    }

    #[test]
    fn test_dependency_decl_parse() {
        assert_eq!(DependencyDecl::parse("node").unwrap(), DependencyDecl::latest("node"));
        let pinned = DependencyDecl::parse("openssl@3.1.4").unwrap();
        assert_eq!(pinned.name, "openssl");
        assert_eq!(pinned.constraint, "3.1.4");
        assert_eq!(pinned.to_string(), "openssl@3.1.4");
        assert!(DependencyDecl::parse("").is_err());
        assert!(DependencyDecl::parse("x@").is_err());
        assert!(DependencyDecl::parse("a b").is_err());
    }

    #[test]
    fn test_name_must_be_a_path_component() {
        for bad in ["../x", "a/b", ".hidden", "Tool", "a b"] {
            let src = format!("[metadata]\nname = \"{}\"\n", bad);
            let err = Recipe::parse(&src, &registry()).unwrap_err();
            assert!(matches!(err, RecipeError::Invalid { .. }), "{bad}");
        }
        for good in ["rt-lib", "python3.12", "g++", "node_modules"] {
            assert!(is_valid_name(good), "{good}");
        }
    }

    #[test]
    fn test_load_from_file_uses_stem_in_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let err = Recipe::load(&path, &registry()).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
