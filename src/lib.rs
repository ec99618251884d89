//! Declarative developer-tool installer
//!
//! A recipe is a TOML document describing how to obtain and assemble a tool
//! as an ordered list of action steps. Installing one goes through a fixed
//! pipeline:
//!
//! 1. **Resolve** the recipe's install-time and runtime dependencies
//!    ([`deps`]), pinning each to a concrete version.
//! 2. **Compile** a deterministic, platform-specific plan ([`plan`]) with
//!    every placeholder substituted.
//! 3. **Execute** the plan step by step ([`engine`]) into a work directory,
//!    commit it to `tools/<name>-<version>/` and record it in `state.json`.
//! 4. **Verify** the result by running the recipe's verify command
//!    ([`verify`]).
//!
//! # Example recipe
//!
//! ```toml
//! [metadata]
//! name = "ripgrep"
//! binaries = ["bin/rg"]
//!
//! [[steps]]
//! action = "download"
//! url = "https://example.invalid/ripgrep-{version}-{arch}.tar.gz"
//!
//! [[steps]]
//! action = "extract"
//! strip_dirs = 1
//!
//! [verify]
//! command = "rg --version"
//! pattern = "ripgrep {version}"
//! ```
//!
//! # Home layout
//!
//! ```text
//! $TOOLSMITH_HOME/
//!   tools/<name>-<version>/     installed versions
//!   tools/current/<name>        active version link
//!   bin/<binary>                links through tools/current
//!   libs/                       shared libraries
//!   work/<name>-<version>/      per-install work directory
//!   state.json                  installation state
//! ```

pub mod actions;
pub mod analysis;
pub mod core;
pub mod deps;
pub mod engine;
pub mod error;
pub mod plan;
pub mod recipe;
pub mod verify;

pub use crate::core::{config::Config, output, platform::Target};
pub use engine::{CancelToken, Engine, InstallReport, Installer};
pub use error::{
    CompileError, Error, ExecuteError, RecipeError, ResolveError, StateError, VerifyError,
};
pub use plan::InstallationPlan;
pub use recipe::Recipe;
