//! Dependency resolution
//!
//! Direct dependencies of a recipe are computed from the actions it uses and
//! the overrides it declares, in this order of precedence:
//!
//! 1. a step's `runtime_dependencies` (or `dependencies`) replaces the
//!    action's implicit set for that step;
//! 2. otherwise the implicit set is used and the step's `extra_*` list is added;
//! 3. a recipe-level replace list clears everything accumulated from steps;
//! 4. a recipe-level `extra_*` list is added to whatever remains.
//!
//! Each dependency is then resolved through the [`RecipeIndex`] and expanded
//! the same way, depth-bounded, so cycles become a hard error instead of
//! unbounded recursion.

pub mod graph;
pub mod version;

use crate::actions::registry::ActionRegistry;
use crate::error::ResolveError;
use crate::recipe::index::RecipeIndex;
use crate::recipe::{DependencyDecl, DependencyOverride, Recipe, LATEST};
use crate::engine::state::validate_version_string;
use graph::DepGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use version::VersionProvider;

/// How deep transitive expansion may go before it is treated as a cycle.
pub const MAX_DEPTH: usize = 10;

/// Ordered, name-unique list of dependency declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclSet {
    decls: Vec<DependencyDecl>,
}

impl DeclSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration. For a name already present, a later pin replaces
    /// the earlier constraint (last pin wins) while a later `latest` never
    /// loosens an existing pin. The name keeps its first position.
    pub fn add(&mut self, decl: DependencyDecl) {
        match self.decls.iter_mut().find(|d| d.name == decl.name) {
            Some(existing) => {
                if decl.constraint != LATEST {
                    existing.constraint = decl.constraint;
                }
            }
            None => self.decls.push(decl),
        }
    }

    pub fn extend<I: IntoIterator<Item = DependencyDecl>>(&mut self, decls: I) {
        for decl in decls {
            self.add(decl);
        }
    }

    pub fn clear(&mut self) {
        self.decls.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyDecl> {
        self.decls.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.decls.iter().map(|d| d.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

/// Direct dependencies of one recipe, before version pinning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectDependencies {
    pub install_time: DeclSet,
    pub runtime: DeclSet,
}

fn latest_all(names: &[String]) -> impl Iterator<Item = DependencyDecl> + '_ {
    names.iter().map(|n| DependencyDecl::latest(n))
}

/// Apply one step's (or the recipe's) replace-or-extend declaration on top
/// of a base set.
fn apply_override(
    target: &mut DeclSet,
    implicit: impl IntoIterator<Item = DependencyDecl>,
    over: &DependencyOverride,
) {
    match &over.replace {
        Some(replacement) => target.extend(replacement.iter().cloned()),
        None => {
            target.extend(implicit);
            target.extend(over.extend.iter().cloned());
        }
    }
}

/// Compute a recipe's direct dependencies.
///
/// `os` selects the OS-specific implicit install-time extras; with `None`
/// both Linux and macOS extras apply.
pub fn resolve_direct(
    recipe: &Recipe,
    registry: &ActionRegistry,
    os: Option<&str>,
) -> DirectDependencies {
    let mut install_time = DeclSet::new();
    let mut runtime = DeclSet::new();

    for step in &recipe.steps {
        let deps = registry
            .get(&step.action)
            .map(|spec| spec.deps.clone())
            .unwrap_or_default();

        let mut implicit_install: Vec<DependencyDecl> = latest_all(&deps.install_time).collect();
        if os.is_none_or(|os| os == "linux") {
            implicit_install.extend(latest_all(&deps.linux_install_time));
        }
        if os.is_none_or(|os| os == "darwin") {
            implicit_install.extend(latest_all(&deps.darwin_install_time));
        }

        let mut step_install = DeclSet::new();
        apply_override(&mut step_install, implicit_install, &step.install_deps);
        install_time.extend(step_install.decls);

        let mut step_runtime = DeclSet::new();
        apply_override(&mut step_runtime, latest_all(&deps.runtime), &step.runtime_deps);
        runtime.extend(step_runtime.decls);
    }

    for (set, over) in [
        (&mut install_time, &recipe.metadata.install_deps),
        (&mut runtime, &recipe.metadata.runtime_deps),
    ] {
        if let Some(replacement) = &over.replace {
            set.clear();
            set.extend(replacement.iter().cloned());
        }
        set.extend(over.extend.iter().cloned());
    }

    DirectDependencies {
        install_time,
        runtime,
    }
}

/// Expanded dependency graph of one recipe.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub root: String,
    /// Direct dependencies of every recipe reached, root included.
    nodes: BTreeMap<String, DirectDependencies>,
}

impl DependencyGraph {
    pub fn direct(&self, name: &str) -> Option<&DirectDependencies> {
        self.nodes.get(name)
    }

    pub fn root_direct(&self) -> Option<&DirectDependencies> {
        self.nodes.get(&self.root)
    }

    /// Every tool reached from the root, root excluded.
    pub fn dependency_names(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|name| **name != self.root)
            .cloned()
            .collect()
    }

    /// Tools to install before the root, dependencies first.
    pub fn install_order(&self) -> Result<Vec<String>, ResolveError> {
        let mut graph = DepGraph::new();
        for (name, direct) in &self.nodes {
            let mut edges = direct.install_time.names();
            for name in direct.runtime.names() {
                if !edges.contains(&name) {
                    edges.push(name);
                }
            }
            graph.add(name, edges);
        }
        let mut order = graph.topological_sort(std::slice::from_ref(&self.root))?;
        order.retain(|name| *name != self.root);
        Ok(order)
    }

    /// The declarations the root needs pinned: its direct install-time deps
    /// with their runtime closures, and its runtime closure.
    pub fn requirements(&self) -> (DeclSet, DeclSet) {
        let Some(root) = self.nodes.get(&self.root) else {
            return (DeclSet::new(), DeclSet::new());
        };

        let mut runtime = DeclSet::new();
        for decl in root.runtime.iter() {
            self.runtime_closure(decl, &mut runtime);
        }

        let mut install_time = DeclSet::new();
        for decl in root.install_time.iter() {
            self.runtime_closure(decl, &mut install_time);
        }
        (install_time, runtime)
    }

    fn runtime_closure(&self, decl: &DependencyDecl, into: &mut DeclSet) {
        let seen = into.iter().any(|d| d.name == decl.name);
        into.add(decl.clone());
        if seen {
            return;
        }
        if let Some(node) = self.nodes.get(&decl.name) {
            for dep in node.runtime.iter() {
                self.runtime_closure(dep, into);
            }
        }
    }
}

/// Pinned dependency versions, split by when they are needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependencySet {
    #[serde(default)]
    pub install_time: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,
}

impl ResolvedDependencySet {
    pub fn is_empty(&self) -> bool {
        self.install_time.is_empty() && self.runtime.is_empty()
    }

    /// Version of `name` from either set.
    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.runtime
            .get(name)
            .or_else(|| self.install_time.get(name))
            .map(String::as_str)
    }
}

/// Output of a full resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub graph: DependencyGraph,
    pub dependencies: ResolvedDependencySet,
}

/// Resolves recipes against an injected [`RecipeIndex`].
pub struct Resolver<'a> {
    index: &'a RecipeIndex,
    os: Option<String>,
    max_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a RecipeIndex) -> Self {
        Self {
            index,
            os: None,
            max_depth: MAX_DEPTH,
        }
    }

    /// Only apply OS-specific implicit dependencies for `os`.
    pub fn for_os(mut self, os: &str) -> Self {
        self.os = Some(os.to_string());
        self
    }

    /// Expand the full dependency graph of `recipe`.
    pub fn expand(&self, recipe: &Recipe) -> Result<DependencyGraph, ResolveError> {
        let mut nodes = BTreeMap::new();
        let mut path = vec![recipe.name().to_string()];
        self.visit(recipe, &mut path, &mut nodes)?;
        Ok(DependencyGraph {
            root: recipe.name().to_string(),
            nodes,
        })
    }

    fn visit(
        &self,
        recipe: &Recipe,
        path: &mut Vec<String>,
        nodes: &mut BTreeMap<String, DirectDependencies>,
    ) -> Result<(), ResolveError> {
        let mut direct = resolve_direct(recipe, self.index.registry(), self.os.as_deref());

        // Canonicalize alias names so every node is keyed by its recipe name.
        let mut children = Vec::new();
        for set in [&mut direct.install_time, &mut direct.runtime] {
            let mut canonical = DeclSet::new();
            for decl in set.iter() {
                let dep = self.lookup(&decl.name, recipe.name())?;
                canonical.add(DependencyDecl {
                    name: dep.name().to_string(),
                    constraint: decl.constraint.clone(),
                });
                children.push(dep);
            }
            *set = canonical;
        }
        nodes.insert(recipe.name().to_string(), direct);

        for child in children {
            let name = child.name().to_string();
            if path.contains(&name) {
                let mut chain = path.clone();
                chain.push(name);
                return Err(ResolveError::CycleDetected { chain });
            }
            if nodes.contains_key(&name) {
                continue;
            }
            if path.len() > self.max_depth {
                let mut chain = path.clone();
                chain.push(name);
                return Err(ResolveError::CycleDetected { chain });
            }

            path.push(name);
            self.visit(&child, path, nodes)?;
            path.pop();
        }
        Ok(())
    }

    fn lookup(
        &self,
        name: &str,
        required_by: &str,
    ) -> Result<std::sync::Arc<Recipe>, ResolveError> {
        self.index
            .resolve(name)
            .map_err(|source| ResolveError::Recipe {
                name: name.to_string(),
                source: Box::new(source),
            })?
            .ok_or_else(|| ResolveError::UnknownDependency {
                name: name.to_string(),
                required_by: required_by.to_string(),
            })
    }

    /// Expand and pin: the end-to-end resolution step.
    pub fn resolve(
        &self,
        recipe: &Recipe,
        provider: &dyn VersionProvider,
    ) -> Result<Resolution, ResolveError> {
        let graph = self.expand(recipe)?;
        let (install_time, runtime) = graph.requirements();
        let dependencies = ResolvedDependencySet {
            install_time: pin_all(&install_time, provider)?,
            runtime: pin_all(&runtime, provider)?,
        };
        tracing::debug!(
            tool = recipe.name(),
            install_time = dependencies.install_time.len(),
            runtime = dependencies.runtime.len(),
            "resolved dependencies"
        );
        Ok(Resolution {
            graph,
            dependencies,
        })
    }
}

fn pin_all(
    decls: &DeclSet,
    provider: &dyn VersionProvider,
) -> Result<BTreeMap<String, String>, ResolveError> {
    decls
        .iter()
        .map(|decl| {
            let unresolved = |reason: String| ResolveError::UnresolvedVersion {
                name: decl.name.clone(),
                constraint: decl.constraint.clone(),
                reason,
            };
            let version = provider
                .resolve_version(&decl.name, &decl.constraint)
                .map_err(unresolved)?;
            validate_version_string(&version).map_err(unresolved)?;
            Ok((decl.name.clone(), version))
        })
        .collect()
}
