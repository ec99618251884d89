//! Plan compilation
//!
//! Turns a recipe, a pinned version, its pinned dependencies and one concrete
//! target into an [`InstallationPlan`]: the applicable steps, in declared
//! order, with every `{placeholder}` expanded. Compilation reads no clock,
//! environment or network, so identical inputs give byte-identical JSON.
//!
//! Variables available to step parameters:
//!
//! | variable | value |
//! |---|---|
//! | `{version}` | pinned tool version |
//! | `{os}`, `{arch}` | target, after the step's `os_mapping`/`arch_mapping` |
//! | `{linux_family}` | target family (Linux targets with a family only) |
//! | `{install_dir}` | staging directory, committed on success |
//! | `{work_dir}` | per-install scratch directory |
//! | `{libs_dir}` | shared library directory |
//! | `{deps.<name>.version}` | pinned version of a dependency |
//!
//! `${NAME}` is shell syntax and is passed through untouched.

use crate::actions::registry::ActionRegistry;
use crate::core::config::Config;
use crate::core::platform::Target;
use crate::deps::ResolvedDependencySet;
use crate::engine::state::validate_version_string;
use crate::error::CompileError;
use crate::recipe::params::{ParamValue, Params};
use crate::recipe::{Recipe, Step, LATEST};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Version of the plan JSON layout.
pub const PLAN_FORMAT_VERSION: u32 = 2;

const OS_MAPPING: &str = "os_mapping";
const ARCH_MAPPING: &str = "arch_mapping";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\$?)\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("regex for placeholders")
    })
}

/// One fully expanded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position of the step in the recipe.
    pub index: usize,
    pub action: String,
    pub params: Params,
    pub evaluable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub format_version: u32,
    pub tool: String,
    pub version: String,
    pub platform: Target,
    pub recipe_hash: String,
    pub dependencies: ResolvedDependencySet,
    pub steps: Vec<PlanStep>,
}

impl InstallationPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Write the plan as JSON, for use as a reproducibility fixture.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let mut json = self.to_json()?;
        json.push('\n');
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write plan: {}", path.display()))
    }

    /// Every step can be replayed from its parameters alone.
    pub fn is_evaluable(&self) -> bool {
        self.steps.iter().all(|s| s.evaluable)
    }
}

/// Directories substituted into plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDirs {
    pub install_dir: PathBuf,
    pub work_dir: PathBuf,
    pub libs_dir: PathBuf,
}

impl PlanDirs {
    /// Directories for installing `tool@version` under `config`'s home.
    pub fn for_install(config: &Config, tool: &str, version: &str) -> Self {
        Self {
            install_dir: config.staging_dir(tool, version),
            work_dir: config.work_dir(tool, version),
            libs_dir: config.libs_dir(),
        }
    }
}

/// Everything a compilation depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub recipe: &'a Recipe,
    pub version: &'a str,
    pub dependencies: &'a ResolvedDependencySet,
    pub target: &'a Target,
    pub dirs: &'a PlanDirs,
}

/// Compile one plan.
pub fn compile(
    input: PlanInput<'_>,
    registry: &ActionRegistry,
) -> Result<InstallationPlan, CompileError> {
    let PlanInput {
        recipe,
        version,
        dependencies,
        target,
        dirs,
    } = input;
    let tool = recipe.name();

    if version == LATEST {
        return Err(CompileError::InvalidVersion {
            tool: tool.to_string(),
            version: version.to_string(),
            reason: "version must be resolved before compiling".to_string(),
        });
    }
    validate_version_string(version).map_err(|reason| CompileError::InvalidVersion {
        tool: tool.to_string(),
        version: version.to_string(),
        reason,
    })?;

    let applicable: Vec<&Step> = recipe.steps.iter().filter(|s| s.applies_to(target)).collect();
    if applicable.is_empty() {
        return Err(CompileError::NoApplicableSteps {
            tool: tool.to_string(),
            target: target.to_string(),
        });
    }

    let base = base_variables(version, dependencies, target, dirs);
    let steps = applicable
        .into_iter()
        .map(|step| compile_step(tool, step, &base, target, registry))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(tool, version, platform = %target, steps = steps.len(), "compiled plan");
    Ok(InstallationPlan {
        format_version: PLAN_FORMAT_VERSION,
        tool: tool.to_string(),
        version: version.to_string(),
        platform: target.clone(),
        recipe_hash: recipe.hash().to_string(),
        dependencies: dependencies.clone(),
        steps,
    })
}

fn base_variables(
    version: &str,
    dependencies: &ResolvedDependencySet,
    target: &Target,
    dirs: &PlanDirs,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("version".to_string(), version.to_string());
    vars.insert("os".to_string(), target.os.clone());
    vars.insert("arch".to_string(), target.arch.clone());
    if let Some(family) = &target.linux_family {
        vars.insert("linux_family".to_string(), family.clone());
    }
    for (key, dir) in [
        ("install_dir", &dirs.install_dir),
        ("work_dir", &dirs.work_dir),
        ("libs_dir", &dirs.libs_dir),
    ] {
        vars.insert(key.to_string(), dir.to_string_lossy().into_owned());
    }
    // Runtime pins win over install-time pins of the same name.
    for (name, pinned) in dependencies.install_time.iter().chain(&dependencies.runtime) {
        vars.insert(format!("deps.{}.version", name), pinned.clone());
    }
    vars
}

fn compile_step(
    tool: &str,
    step: &Step,
    base: &BTreeMap<String, String>,
    target: &Target,
    registry: &ActionRegistry,
) -> Result<PlanStep, CompileError> {
    let mut params = step.params.clone();
    let os_mapping = params.remove(OS_MAPPING);
    let arch_mapping = params.remove(ARCH_MAPPING);

    let mut vars = base.clone();
    remap(&mut vars, "os", os_mapping.as_ref());
    remap(&mut vars, "arch", arch_mapping.as_ref());

    let unexpanded = |param: &str, placeholder: &str| CompileError::UnexpandedPlaceholder {
        tool: tool.to_string(),
        step: step.index,
        action: step.action.clone(),
        param: param.to_string(),
        placeholder: placeholder.to_string(),
        target: target.to_string(),
    };

    let mut expanded = Params::new();
    for (key, value) in &params {
        let value = value.try_map_strings(key, &mut |path: &str, s: &str| {
            let out = substitute(s, &vars).map_err(|token| unexpanded(path, &token))?;
            match leftover_placeholder(&out) {
                Some(token) => Err(unexpanded(path, &token)),
                None => Ok(out),
            }
        })?;
        expanded.insert(key.clone(), value);
    }

    Ok(PlanStep {
        index: step.index,
        action: step.action.clone(),
        params: expanded,
        evaluable: registry.get(&step.action).is_some_and(|spec| spec.evaluable),
    })
}

fn remap(vars: &mut BTreeMap<String, String>, key: &str, mapping: Option<&ParamValue>) {
    let Some(mapping) = mapping.and_then(ParamValue::as_string_map) else {
        return;
    };
    if let Some(current) = vars.get_mut(key)
        && let Some(mapped) = mapping.get(current.as_str())
    {
        *current = mapped.clone();
    }
}

/// Single substitution pass. Returns the first unknown token on failure.
fn substitute(input: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(whole), Some(dollar), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);
        if !dollar.as_str().is_empty() {
            out.push_str(whole.as_str());
        } else {
            match vars.get(name.as_str()) {
                Some(value) => out.push_str(value),
                None => return Err(whole.as_str().to_string()),
            }
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// A `{name}` token still present after expansion.
fn leftover_placeholder(s: &str) -> Option<String> {
    placeholder_regex()
        .captures_iter(s)
        .filter(|caps| caps.get(1).is_some_and(|d| d.as_str().is_empty()))
        .find_map(|caps| caps.get(0).map(|m| m.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::registry::ActionSpec;

    fn registry() -> ActionRegistry {
        let mut r = ActionRegistry::builtin();
        r.register("fetch", ActionSpec::new().runtime(&["rt-lib"]).evaluable());
        r
    }

    fn dirs() -> PlanDirs {
        PlanDirs {
            install_dir: PathBuf::from("/home/u/.toolsmith/work/sample-1.2.3/.install"),
            work_dir: PathBuf::from("/home/u/.toolsmith/work/sample-1.2.3"),
            libs_dir: PathBuf::from("/home/u/.toolsmith/libs"),
        }
    }

    fn deps() -> ResolvedDependencySet {
        ResolvedDependencySet {
            install_time: BTreeMap::new(),
            runtime: BTreeMap::from([("rt-lib".to_string(), "0.9.1".to_string())]),
        }
    }

    fn debian() -> Target {
        Target::new("linux", "amd64").with_family("debian")
    }

    fn compile_src(src: &str, version: &str, target: &Target) -> Result<InstallationPlan, CompileError> {
        let reg = registry();
        let recipe = Recipe::parse(src, &reg).unwrap();
        let deps = deps();
        let dirs = dirs();
        compile(
            PlanInput {
                recipe: &recipe,
                version,
                dependencies: &deps,
                target,
                dirs: &dirs,
            },
            &reg,
        )
    }

    const SAMPLE: &str = r#"
[metadata]
name = "sample"

[[steps]]
action = "fetch"
url = "https://example.com/{version}/sample-{os}-{arch}.tar.gz?rt={deps.rt-lib.version}"
dest = "{work_dir}/sample.tar.gz"
"#;

    #[test]
    fn test_happy_path_expands_everything() {
        let plan = compile_src(SAMPLE, "1.2.3", &debian()).unwrap();
        assert_eq!(plan.format_version, PLAN_FORMAT_VERSION);
        assert_eq!(plan.tool, "sample");
        assert_eq!(plan.version, "1.2.3");
        assert_eq!(plan.platform, debian());
        assert_eq!(plan.steps.len(), 1);

        let step = &plan.steps[0];
        assert_eq!(step.action, "fetch");
        assert!(step.evaluable);
        assert_eq!(
            step.params["url"].as_str(),
            Some("https://example.com/1.2.3/sample-linux-amd64.tar.gz?rt=0.9.1")
        );
        assert_eq!(
            step.params["dest"].as_str(),
            Some("/home/u/.toolsmith/work/sample-1.2.3/sample.tar.gz")
        );
        assert_eq!(plan.dependencies, deps());
    }

    #[test]
    fn test_compilation_is_byte_identical() {
        let a = compile_src(SAMPLE, "1.2.3", &debian()).unwrap().to_json().unwrap();
        let b = compile_src(SAMPLE, "1.2.3", &debian()).unwrap().to_json().unwrap();
        assert_eq!(a, b);

        let c = compile_src(SAMPLE, "1.2.4", &debian()).unwrap().to_json().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_json_roundtrip_preserves_plan() {
        let plan = compile_src(SAMPLE, "1.2.3", &debian()).unwrap();
        let back = InstallationPlan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_filters_steps_by_target() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "apt_install"
packages = ["x"]
[[steps]]
action = "dnf_install"
packages = ["x"]
[[steps]]
action = "download"
url = "https://x/{os}"
"#;
        let plan = compile_src(src, "1.0", &debian()).unwrap();
        let indices: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(!plan.is_evaluable());

        let plan = compile_src(src, "1.0", &Target::new("darwin", "arm64")).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].index, 2);
    }

    #[test]
    fn test_no_applicable_steps() {
        let src = "[metadata]\nname = \"x\"\n[[steps]]\naction = \"brew_install\"\nformula = \"x\"\n";
        let err = compile_src(src, "1.0", &debian()).unwrap_err();
        match err {
            CompileError::NoApplicableSteps { tool, target } => {
                assert_eq!(tool, "x");
                assert_eq!(target, "linux/amd64 (debian)");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_unknown_placeholder_is_hard_error() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "download"
url = "https://x/{version}"
[[steps]]
action = "install_binaries"
binaries = ["bin/x", "bin/{nope}"]
"#;
        match compile_src(src, "1.0", &debian()).unwrap_err() {
            CompileError::UnexpandedPlaceholder {
                step,
                action,
                param,
                placeholder,
                ..
            } => {
                assert_eq!(step, 1);
                assert_eq!(action, "install_binaries");
                assert_eq!(param, "binaries[1]");
                assert_eq!(placeholder, "{nope}");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_version_is_unexpanded() {
        let src = "[metadata]\nname = \"x\"\n[[steps]]\naction = \"download\"\nurl = \"{deps.zlib.version}\"\n";
        assert!(matches!(
            compile_src(src, "1.0", &debian()).unwrap_err(),
            CompileError::UnexpandedPlaceholder { .. }
        ));
    }

    #[test]
    fn test_shell_variables_pass_through() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "run_command"
command = "echo ${HOME} {version} > {install_dir}/v"
"#;
        let plan = compile_src(src, "1.0", &debian()).unwrap();
        assert_eq!(
            plan.steps[0].params["command"].as_str(),
            Some("echo ${HOME} 1.0 > /home/u/.toolsmith/work/sample-1.2.3/.install/v")
        );
    }

    #[test]
    fn test_platform_mappings_apply_and_disappear() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "download"
url = "https://x/{os}-{arch}"
os_mapping = { darwin = "macos" }
arch_mapping = { amd64 = "x86_64", arm64 = "aarch64" }
"#;
        let plan = compile_src(src, "1.0", &Target::new("darwin", "arm64")).unwrap();
        let params = &plan.steps[0].params;
        assert_eq!(params["url"].as_str(), Some("https://x/macos-aarch64"));
        assert!(!params.contains_key("os_mapping"));
        assert!(!params.contains_key("arch_mapping"));

        let plan = compile_src(src, "1.0", &debian()).unwrap();
        assert_eq!(plan.steps[0].params["url"].as_str(), Some("https://x/linux-x86_64"));
    }

    #[test]
    fn test_family_placeholder() {
        let src = "[metadata]\nname = \"x\"\n[[steps]]\naction = \"download\"\nurl = \"https://x/{linux_family}\"\n";
        let plan = compile_src(src, "1.0", &debian()).unwrap();
        assert_eq!(plan.steps[0].params["url"].as_str(), Some("https://x/debian"));

        // Darwin has no family to substitute.
        assert!(matches!(
            compile_src(src, "1.0", &Target::new("darwin", "amd64")).unwrap_err(),
            CompileError::UnexpandedPlaceholder { .. }
        ));
    }

    #[test]
    fn test_nested_params_expanded() {
        let src = r#"
[metadata]
name = "x"
[[steps]]
action = "set_env"
vars = { X_HOME = "{install_dir}", X_VERSION = "{version}" }
"#;
        let plan = compile_src(src, "2.0", &debian()).unwrap();
        let vars = plan.steps[0].params["vars"].as_string_map().unwrap();
        assert_eq!(vars["X_VERSION"], "2.0");
        assert!(vars["X_HOME"].ends_with(".install"));
    }

    #[test]
    fn test_latest_and_bad_versions_rejected() {
        assert!(matches!(
            compile_src(SAMPLE, "latest", &debian()).unwrap_err(),
            CompileError::InvalidVersion { .. }
        ));
        assert!(matches!(
            compile_src(SAMPLE, "../../etc", &debian()).unwrap_err(),
            CompileError::InvalidVersion { .. }
        ));
    }

    #[test]
    fn test_substitute_helpers() {
        let vars = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert_eq!(substitute("{a}-${a}-{a}", &vars).unwrap(), "1-${a}-1");
        assert_eq!(substitute("{ not a token }", &vars).unwrap(), "{ not a token }");
        assert_eq!(substitute("{b}", &vars).unwrap_err(), "{b}");
        assert_eq!(leftover_placeholder("x {y} ${z}"), Some("{y}".to_string()));
        assert_eq!(leftover_placeholder("${z} {\"json\": 1}"), None);
    }
}
