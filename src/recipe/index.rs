//! Recipe index
//!
//! A read-through cache of parsed recipes keyed by canonical name. The index
//! is owned by the caller and handed to the resolver; tests inject a
//! [`MemorySource`] instead of touching the filesystem.
//!
//! Names that are not canonical recipe names are looked up in the
//! `satisfies` alias table, which is built on first miss by scanning every
//! recipe the source knows about.

use super::Recipe;
use crate::actions::registry::ActionRegistry;
use crate::error::RecipeError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use walkdir::WalkDir;

/// Where recipe bytes come from.
pub trait RecipeSource: Send + Sync {
    /// Raw recipe text for `name`, or `None` if there is no such recipe.
    fn read(&self, name: &str) -> Result<Option<String>, RecipeError>;

    /// Every recipe name the source can provide.
    fn names(&self) -> Result<Vec<String>, RecipeError>;
}

/// Recipes stored as `<name>.toml` anywhere below a root directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        if !self.root.exists() {
            return found;
        }
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && super::is_valid_name(stem)
            {
                found.entry(stem.to_string()).or_insert_with(|| path.to_path_buf());
            }
        }
        found
    }
}

impl RecipeSource for DirSource {
    fn read(&self, name: &str) -> Result<Option<String>, RecipeError> {
        // No file can back an invalid name; aliases are still looked up.
        if !super::is_valid_name(name) {
            tracing::debug!(name, "not a valid recipe file name");
            return Ok(None);
        }
        let direct = self.root.join(format!("{}.toml", name));
        let path = if direct.is_file() {
            Some(direct)
        } else {
            self.scan().remove(name)
        };
        match path {
            Some(path) => std::fs::read_to_string(&path)
                .map(Some)
                .map_err(|source| RecipeError::Io { path, source }),
            None => Ok(None),
        }
    }

    fn names(&self) -> Result<Vec<String>, RecipeError> {
        Ok(self.scan().into_keys().collect())
    }
}

/// In-memory recipes.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    recipes: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, content: &str) -> Self {
        self.insert(name, content);
        self
    }

    pub fn insert(&mut self, name: &str, content: &str) {
        self.recipes.insert(name.to_string(), content.to_string());
    }
}

impl RecipeSource for MemorySource {
    fn read(&self, name: &str) -> Result<Option<String>, RecipeError> {
        Ok(self.recipes.get(name).cloned())
    }

    fn names(&self) -> Result<Vec<String>, RecipeError> {
        Ok(self.recipes.keys().cloned().collect())
    }
}

#[derive(Default)]
struct Cache {
    recipes: BTreeMap<String, Arc<Recipe>>,
    /// Alias name to canonical recipe name. Built once, on first miss.
    aliases: Option<BTreeMap<String, String>>,
}

pub struct RecipeIndex {
    source: Box<dyn RecipeSource>,
    registry: Arc<ActionRegistry>,
    cache: Mutex<Cache>,
}

impl RecipeIndex {
    pub fn new(source: impl RecipeSource + 'static, registry: Arc<ActionRegistry>) -> Self {
        Self {
            source: Box::new(source),
            registry,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// An index with no recipes.
    pub fn empty(registry: Arc<ActionRegistry>) -> Self {
        Self::new(MemorySource::new(), registry)
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load a recipe by canonical name.
    pub fn get(&self, name: &str) -> Result<Option<Arc<Recipe>>, RecipeError> {
        if let Some(recipe) = self.lock().recipes.get(name) {
            return Ok(Some(Arc::clone(recipe)));
        }

        let Some(content) = self.source.read(name)? else {
            return Ok(None);
        };
        let recipe = Arc::new(Recipe::parse_named(&content, name, &self.registry)?);
        if recipe.name() != name {
            return Err(RecipeError::Invalid {
                name: name.to_string(),
                reason: format!("metadata.name is '{}'", recipe.name()),
            });
        }

        tracing::debug!(recipe = name, "loaded recipe");
        self.lock()
            .recipes
            .insert(name.to_string(), Arc::clone(&recipe));
        Ok(Some(recipe))
    }

    /// Load a recipe by canonical name, falling back to `satisfies` aliases.
    pub fn resolve(&self, name: &str) -> Result<Option<Arc<Recipe>>, RecipeError> {
        if let Some(recipe) = self.get(name)? {
            return Ok(Some(recipe));
        }
        match self.alias_target(name)? {
            Some(canonical) => self.get(&canonical),
            None => Ok(None),
        }
    }

    fn alias_target(&self, name: &str) -> Result<Option<String>, RecipeError> {
        if let Some(aliases) = &self.lock().aliases {
            return Ok(aliases.get(name).cloned());
        }

        let mut aliases = BTreeMap::new();
        for canonical in self.source.names()? {
            let Some(recipe) = self.get(&canonical)? else {
                continue;
            };
            for alias in recipe.metadata.satisfies.values().flatten() {
                aliases
                    .entry(alias.clone())
                    .or_insert_with(|| canonical.clone());
            }
        }
        tracing::debug!(aliases = aliases.len(), "built recipe alias index");

        let target = aliases.get(name).cloned();
        self.lock().aliases = Some(aliases);
        Ok(target)
    }

    /// Every recipe name the source provides.
    pub fn names(&self) -> Result<Vec<String>, RecipeError> {
        self.source.names()
    }
}
