//! End-to-end install pipeline: resolve, compile, execute, verify.

mod common;

use common::*;
use toolsmith::Installer;
use toolsmith::deps::Resolver;
use toolsmith::deps::version::PinnedVersions;
use toolsmith::engine::state::StateManager;
use toolsmith::error::{CompileError, Error, ExecuteError, RecipeError};
use toolsmith::plan::{self, PlanDirs, PlanInput};
use toolsmith::verify::Verifier;

const SAMPLE: &str = r#"
[metadata]
name = "sample"

[[steps]]
action = "stamp_rt"
message = "linked against rt-lib {deps.rt-lib.version} on {os}/{arch}"
"#;

const RT_LIB: &str = r#"
[metadata]
name = "rt-lib"

[[steps]]
action = "stamp"
"#;

#[test]
fn test_happy_path_plan_and_state() {
    let env = TestEnv::new();
    env.write_recipe("sample", SAMPLE);
    env.write_recipe("rt-lib", RT_LIB);
    let index = env.test_index();
    let handlers = test_handlers();
    let provider = PinnedVersions::new().with("rt-lib", "0.4.2");

    let installer = Installer::new(&env.config, &index, &handlers).target(debian_amd64());
    let plan = installer.plan("sample", "1.2.3", &provider).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.version, "1.2.3");
    assert_eq!(plan.platform, debian_amd64());
    assert_eq!(
        plan.steps[0].params["message"].as_str(),
        Some("linked against rt-lib 0.4.2 on linux/amd64")
    );
    assert_eq!(
        plan.dependencies.runtime.get("rt-lib").map(String::as_str),
        Some("0.4.2")
    );

    let report = installer.install("sample", "1.2.3", &provider).unwrap();
    assert_eq!(report.plan, plan);
    assert_eq!(report.result.steps_run, 1);
    assert_eq!(
        report.dependencies_installed,
        vec![("rt-lib".to_string(), "0.4.2".to_string())]
    );
    assert!(report.verification.is_none());

    let state = StateManager::from_config(&env.config).load().unwrap();
    let sample = state.get("sample").unwrap();
    assert_eq!(sample.active_version, "1.2.3");
    assert_eq!(sample.versions.len(), 1);
    assert_eq!(sample.versions["1.2.3"].requested, "1.2.3");
    assert!(sample.is_explicit);
    assert_eq!(
        sample.runtime_dependencies.get("rt-lib").map(String::as_str),
        Some("0.4.2")
    );
    assert_eq!(state.get("rt-lib").unwrap().active_version, "0.4.2");

    assert!(read_bin(&env.config, "sample").starts_with("1.2.3\nlinked against rt-lib 0.4.2"));
    assert!(!env.config.work_dir("sample", "1.2.3").exists());
}

#[test]
fn test_installed_dependency_is_not_reinstalled() {
    let env = TestEnv::new();
    env.write_recipe("sample", SAMPLE);
    env.write_recipe("rt-lib", RT_LIB);
    let index = env.test_index();
    let handlers = test_handlers();
    let provider = PinnedVersions::new().with("rt-lib", "0.4.2");
    let installer = Installer::new(&env.config, &index, &handlers).target(debian_amd64());

    installer.install("rt-lib", "0.4.2", &provider).unwrap();
    let report = installer.install("sample", "1.0.0", &provider).unwrap();
    assert!(report.dependencies_installed.is_empty());

    // Installed explicitly first, so it stays explicit.
    let state = StateManager::from_config(&env.config).load().unwrap();
    let rt = state.get("rt-lib").unwrap();
    assert!(rt.is_explicit);
    assert!(rt.required_by.contains("sample"));
}

#[test]
fn test_compile_is_deterministic() {
    let env = TestEnv::new();
    env.write_recipe("sample", SAMPLE);
    env.write_recipe("rt-lib", RT_LIB);
    let index = env.test_index();
    let recipe = index.resolve("sample").unwrap().unwrap();
    let provider = PinnedVersions::new().with("rt-lib", "0.4.2");
    let resolution = Resolver::new(&index).resolve(&recipe, &provider).unwrap();
    let target = debian_amd64();
    let dirs = PlanDirs::for_install(&env.config, "sample", "1.2.3");

    let compile = || {
        plan::compile(
            PlanInput {
                recipe: &recipe,
                version: "1.2.3",
                dependencies: &resolution.dependencies,
                target: &target,
                dirs: &dirs,
            },
            index.registry(),
        )
        .unwrap()
        .to_json()
        .unwrap()
    };
    let first = compile();
    assert_eq!(first, compile());

    // A different dependency pin changes the bytes.
    let mut other = resolution.dependencies.clone();
    other.runtime.insert("rt-lib".to_string(), "0.5.0".to_string());
    let changed = plan::compile(
        PlanInput {
            recipe: &recipe,
            version: "1.2.3",
            dependencies: &other,
            target: &target,
            dirs: &dirs,
        },
        index.registry(),
    )
    .unwrap()
    .to_json()
    .unwrap();
    assert_ne!(first, changed);
}

#[test]
fn test_unexpanded_placeholder_fails_before_execution() {
    let env = TestEnv::new();
    env.write_recipe(
        "typo",
        r#"
[metadata]
name = "typo"

[[steps]]
action = "stamp"
message = "built for {platfrom}"
"#,
    );
    let index = env.test_index();
    let handlers = test_handlers();

    let err = Installer::new(&env.config, &index, &handlers)
        .target(debian_amd64())
        .install("typo", "1.0.0", &PinnedVersions::new())
        .unwrap_err();
    match err {
        Error::Compile(CompileError::UnexpandedPlaceholder {
            placeholder, param, ..
        }) => {
            assert_eq!(placeholder, "{platfrom}");
            assert_eq!(param, "message");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!env.config.tool_dir("typo", "1.0.0").exists());
}

#[test]
fn test_no_steps_for_target() {
    let env = TestEnv::new();
    env.write_recipe(
        "macos-only",
        r#"
[metadata]
name = "macos-only"

[[steps]]
action = "stamp"
when = { os = ["darwin"] }
"#,
    );
    let index = env.test_index();
    let handlers = test_handlers();

    let err = Installer::new(&env.config, &index, &handlers)
        .target(debian_amd64())
        .install("macos-only", "1.0.0", &PinnedVersions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Compile(CompileError::NoApplicableSteps { .. })
    ));
}

#[test]
fn test_action_without_handler() {
    let env = TestEnv::new();
    env.write_recipe(
        "manual-tool",
        r#"
[metadata]
name = "manual-tool"

[[steps]]
action = "manual"
text = "download it yourself"
"#,
    );
    let index = env.builtin_index();
    let handlers = toolsmith::actions::HandlerRegistry::builtin();

    let err = Installer::new(&env.config, &index, &handlers)
        .target(debian_amd64())
        .install("manual-tool", "1.0.0", &PinnedVersions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Execute(ExecuteError::NoHandler { ref action, .. }) if action == "manual"
    ));
    let state = StateManager::from_config(&env.config).load().unwrap();
    assert!(state.get("manual-tool").is_none());
}

#[test]
fn test_unknown_action_rejected_at_load() {
    let env = TestEnv::new();
    env.write_recipe(
        "bogus",
        r#"
[metadata]
name = "bogus"

[[steps]]
action = "teleport"
"#,
    );
    let index = env.test_index();
    let handlers = test_handlers();

    let err = Installer::new(&env.config, &index, &handlers)
        .install("bogus", "1.0.0", &PinnedVersions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Recipe(RecipeError::UnknownAction { .. })
    ));
}

/// Real shell steps and the default shell verifier.
#[cfg(unix)]
#[test]
fn test_builtin_handlers_and_shell_verify() {
    let env = TestEnv::new();
    env.write_recipe(
        "greeter",
        r#"
[metadata]
name = "greeter"

[[steps]]
action = "set_env"
vars = { GREETING = "hello from greeter" }

[[steps]]
action = "run_command"
command = '''printf '#!/bin/sh\necho "%s {version}"\n' "$GREETING" > greeter'''

[[steps]]
action = "install_binaries"
binaries = ["greeter"]

[verify]
command = "greeter"
pattern = "greeter v{version}"
version_format = "strip_v"
"#,
    );
    let index = env.builtin_index();
    let handlers = toolsmith::actions::HandlerRegistry::builtin();

    let report = Installer::new(&env.config, &index, &handlers)
        .target(debian_amd64())
        .install("greeter", "v2.0.1", &PinnedVersions::new())
        .unwrap();

    let verification = report.verification.unwrap();
    assert!(verification.passed, "output: {}", verification.output);
    assert_eq!(verification.transformed_version.as_deref(), Some("2.0.1"));
    assert_eq!(verification.expected, "greeter v2.0.1");
    assert_eq!(report.result.binaries, vec!["bin/greeter"]);

    let out = std::process::Command::new(env.config.bin_dir().join("greeter"))
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&out.stdout).trim(),
        "hello from greeter v2.0.1"
    );

    // Re-verifying the active version from state gives the same answer.
    let state = StateManager::from_config(&env.config).load().unwrap();
    let recipe = index.resolve("greeter").unwrap().unwrap();
    assert!(
        Verifier::default()
            .verify_active(&env.config, &state, &recipe)
            .unwrap()
            .passed
    );
}
