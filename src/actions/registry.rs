//! Action registry
//!
//! Read-only table mapping an action name to its implicit dependencies and
//! implicit platform constraint. Recipes are validated against it at load time.

use crate::analysis::constraint::Constraint;
use std::collections::BTreeMap;

/// Dependencies an action pulls in without the recipe saying so.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDeps {
    pub install_time: Vec<String>,
    pub runtime: Vec<String>,
    /// Extra install-time dependencies when installing on Linux.
    pub linux_install_time: Vec<String>,
    /// Extra install-time dependencies when installing on macOS.
    pub darwin_install_time: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSpec {
    pub deps: ActionDeps,
    pub constraint: Constraint,
    /// The step's effect is fully described by its parameters.
    pub evaluable: bool,
}

impl ActionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(mut self, deps: &[&str]) -> Self {
        self.deps.install_time = to_strings(deps);
        self
    }

    pub fn runtime(mut self, deps: &[&str]) -> Self {
        self.deps.runtime = to_strings(deps);
        self
    }

    pub fn linux_install(mut self, deps: &[&str]) -> Self {
        self.deps.linux_install_time = to_strings(deps);
        self
    }

    pub fn darwin_install(mut self, deps: &[&str]) -> Self {
        self.deps.darwin_install_time = to_strings(deps);
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn evaluable(mut self) -> Self {
        self.evaluable = true;
        self
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, ActionSpec>,
}

impl ActionRegistry {
    /// An empty registry. Tests build their own tables from this.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in action table.
    pub fn builtin() -> Self {
        let mut r = Self::new();

        // Primitives
        for name in ["download", "extract", "chmod", "install_binaries", "set_env"] {
            r.register(name, ActionSpec::new().evaluable());
        }
        for name in [
            "run_command",
            "require_command",
            "manual",
            "group_add",
            "service_enable",
            "service_start",
        ] {
            r.register(name, ActionSpec::new());
        }

        // Ecosystem installers
        let node = ActionSpec::new().install(&["nodejs"]).runtime(&["nodejs"]);
        r.register("npm_install", node.clone());
        r.register("npm_exec", node);

        let ruby = ActionSpec::new().install(&["ruby"]).runtime(&["ruby"]);
        r.register("gem_install", ruby.clone());
        r.register("gem_exec", ruby);

        r.register("cargo_install", ActionSpec::new().install(&["rust"]));
        r.register("cargo_build", ActionSpec::new().install(&["rust"]));
        r.register("go_install", ActionSpec::new().install(&["go"]));
        r.register("go_build", ActionSpec::new().install(&["go"]));
        r.register("pipx_install", ActionSpec::new().install(&["python"]));

        // Source builds
        r.register(
            "configure_make",
            ActionSpec::new().install(&["make", "zig", "pkg-config"]),
        );
        r.register("cmake_build", ActionSpec::new().install(&["cmake", "make", "zig"]));
        r.register(
            "meson_build",
            ActionSpec::new()
                .install(&["meson", "make", "zig"])
                .linux_install(&["patchelf"]),
        );

        // Bottles and nix
        r.register("homebrew", ActionSpec::new().linux_install(&["patchelf"]));
        r.register(
            "homebrew_relocate",
            ActionSpec::new().linux_install(&["patchelf"]).evaluable(),
        );
        let nix = ActionSpec::new()
            .install(&["nix-portable"])
            .constraint(Constraint::os("linux"));
        r.register("nix_install", nix.clone());
        r.register("nix_realize", nix);

        // System package managers
        for (name, family) in [
            ("apt_install", "debian"),
            ("apt_repo", "debian"),
            ("apt_ppa", "debian"),
            ("dnf_install", "rhel"),
            ("dnf_repo", "rhel"),
            ("pacman_install", "arch"),
            ("apk_install", "alpine"),
            ("zypper_install", "suse"),
        ] {
            r.register(name, ActionSpec::new().constraint(Constraint::family(family)));
        }
        for name in ["brew_install", "brew_cask"] {
            r.register(name, ActionSpec::new().constraint(Constraint::os("darwin")));
        }

        r
    }

    pub fn register(&mut self, name: &str, spec: ActionSpec) {
        self.actions.insert(name.to_string(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_npm_deps() {
        let registry = ActionRegistry::builtin();
        let npm = registry.get("npm_install").unwrap();
        assert_eq!(npm.deps.install_time, vec!["nodejs"]);
        assert_eq!(npm.deps.runtime, vec!["nodejs"]);
        assert!(npm.constraint.is_unconstrained());
    }

    #[test]
    fn test_builtin_system_constraints() {
        let registry = ActionRegistry::builtin();
        assert_eq!(
            registry.get("apt_install").unwrap().constraint,
            Constraint::family("debian")
        );
        assert_eq!(
            registry.get("zypper_install").unwrap().constraint,
            Constraint::family("suse")
        );
        assert_eq!(
            registry.get("brew_cask").unwrap().constraint,
            Constraint::os("darwin")
        );
    }

    #[test]
    fn test_builtin_platform_specific_deps() {
        let registry = ActionRegistry::builtin();
        let meson = registry.get("meson_build").unwrap();
        assert_eq!(meson.deps.linux_install_time, vec!["patchelf"]);
        assert!(meson.deps.darwin_install_time.is_empty());
    }

    #[test]
    fn test_evaluable_flags() {
        let registry = ActionRegistry::builtin();
        assert!(registry.get("download").unwrap().evaluable);
        assert!(!registry.get("run_command").unwrap().evaluable);
        assert!(!registry.get("cargo_install").unwrap().evaluable);
    }

    #[test]
    fn test_custom_registry() {
        let mut registry = ActionRegistry::new();
        assert!(!registry.contains("download"));
        registry.register("fetch", ActionSpec::new().runtime(&["rt-lib"]));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["fetch"]);
    }
}
