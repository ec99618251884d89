//! toolsmith CLI - sudo-free, multi-version developer tool installer
//!
//! Usage:
//!   toolsmith install <tool>            Install a tool and its dependencies
//!   toolsmith plan <tool>               Print the installation plan
//!   toolsmith platforms <tool>          Show which platforms a recipe supports
//!   toolsmith deps <tool>               Show resolved dependencies
//!   toolsmith activate <tool> <version> Switch the active version
//!   toolsmith remove <tool>             Remove a tool or one version of it
//!   toolsmith list                      List installed tools
//!   toolsmith verify <tool>             Re-verify the active version

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use toolsmith::actions::HandlerRegistry;
use toolsmith::actions::registry::ActionRegistry;
use toolsmith::analysis::policy::{classify_recipe, plan_targets};
use toolsmith::core::platform::{is_known_arch, is_known_family, is_known_os};
use toolsmith::deps::Resolver;
use toolsmith::deps::version::{ChainProvider, InstalledVersions, PinnedVersions};
use toolsmith::engine::installer::{self, default_target};
use toolsmith::engine::state::StateManager;
use toolsmith::recipe::index::{DirSource, RecipeIndex};
use toolsmith::recipe::{DependencyDecl, LATEST, Recipe};
use toolsmith::verify::Verifier;
use toolsmith::{Config, Installer, Target, output};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolsmith")]
#[command(about = "Install developer tools from declarative recipes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Home directory (default: ~/.toolsmith)
    #[arg(long, global = true, env = "TOOLSMITH_HOME")]
    home: Option<PathBuf>,

    /// Path to recipes directory
    #[arg(short = 'r', long, global = true, env = "TOOLSMITH_RECIPES")]
    recipes: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a tool
    Install {
        tool: String,

        /// Version to install
        #[arg(long, default_value = LATEST)]
        version: String,

        /// Pin what "latest" means for a tool (name@version), repeatable
        #[arg(long = "pin", value_name = "NAME@VERSION")]
        pins: Vec<String>,

        /// Skip post-install verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Compile and print the installation plan
    Plan {
        tool: String,

        #[arg(long, default_value = LATEST)]
        version: String,

        #[arg(long = "pin", value_name = "NAME@VERSION")]
        pins: Vec<String>,

        /// Target OS (default: host)
        #[arg(long)]
        os: Option<String>,

        /// Target architecture (default: host)
        #[arg(long)]
        arch: Option<String>,

        /// Target Linux family
        #[arg(long)]
        family: Option<String>,

        /// Write the plan here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show the platform policy and plan targets of a recipe
    Platforms { tool: String },

    /// Show dependencies and install order
    Deps {
        tool: String,

        /// Only apply OS-specific dependencies for this OS
        #[arg(long)]
        os: Option<String>,
    },

    /// Make an installed version active
    Activate { tool: String, version: String },

    /// Remove a tool, or a single version of it
    Remove {
        tool: String,

        #[arg(long)]
        version: Option<String>,
    },

    /// List installed tools
    List,

    /// Re-run verification for the active version
    Verify { tool: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        output::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        std::env::var("TOOLSMITH_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.home {
        Some(home) => Config::load_from(home)?.with_env_overrides(),
        None => Config::load()?,
    };
    if let Some(recipes) = &cli.recipes {
        config = config.with_recipes_dir(recipes);
    }
    Ok(config)
}

fn open_index(config: &Config) -> RecipeIndex {
    RecipeIndex::new(
        DirSource::new(config.recipes_dir()),
        Arc::new(ActionRegistry::builtin()),
    )
}

fn load_recipe(index: &RecipeIndex, config: &Config, tool: &str) -> Result<Arc<Recipe>> {
    match index.resolve(tool)? {
        Some(recipe) => Ok(recipe),
        None => bail!(
            "Recipe not found: {}\nSearched in: {}",
            tool,
            config.recipes_dir().display()
        ),
    }
}

/// Pins from `--pin`, then what is already installed.
fn version_provider(config: &Config, pins: &[String]) -> Result<ChainProvider> {
    let mut pinned = PinnedVersions::new();
    for pin in pins {
        let decl = DependencyDecl::parse(pin)
            .map_err(|reason| anyhow::anyhow!("invalid --pin '{}': {}", pin, reason))?;
        if decl.constraint == LATEST {
            bail!("invalid --pin '{}': expected NAME@VERSION", pin);
        }
        pinned.insert(&decl.name, &decl.constraint);
    }
    let state = StateManager::from_config(config).load()?;
    Ok(ChainProvider::new()
        .push(pinned)
        .push(InstalledVersions::from_state(&state)))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Install {
            tool,
            version,
            pins,
            no_verify,
        } => {
            config
                .ensure_layout()
                .context("Failed to prepare toolsmith home")?;
            let index = open_index(&config);
            let handlers = HandlerRegistry::builtin();
            let provider = version_provider(&config, &pins)?;

            let mut installer = Installer::new(&config, &index, &handlers).on_step(
                |tool: &str, position: usize, total: usize, step: &toolsmith::plan::PlanStep| {
                    output::action_numbered(position, total, &format!("{}: {}", tool, step.action));
                },
            );
            if no_verify {
                installer = installer.skip_verify();
            }

            output::action(&format!("Installing {} ({})", tool, version));
            let report = installer.install(&tool, &version, &provider)?;

            for (name, version) in &report.dependencies_installed {
                output::detail(&format!("dependency {} {}", name, version));
            }
            match &report.verification {
                Some(outcome) if !outcome.passed => {
                    let reason = outcome
                        .failure
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    output::warning(&format!("verification failed: {}", reason));
                }
                Some(_) => output::detail("verified"),
                None => {}
            }
            output::success(&format!(
                "Installed {} {}",
                report.result.tool, report.result.version
            ));
            for binary in &report.result.binaries {
                output::detail(binary);
            }
        }

        Commands::Plan {
            tool,
            version,
            pins,
            os,
            arch,
            family,
            out,
        } => {
            let target = plan_target(&config, os, arch, family)?;
            let index = open_index(&config);
            let handlers = HandlerRegistry::builtin();
            let provider = version_provider(&config, &pins)?;
            let plan = Installer::new(&config, &index, &handlers)
                .target(target)
                .plan(&tool, &version, &provider)?;

            match out {
                Some(path) => {
                    plan.write(&path)?;
                    output::success(&format!("Wrote plan to {}", path.display()));
                }
                None => println!("{}", plan.to_json()?),
            }
        }

        Commands::Platforms { tool } => {
            let index = open_index(&config);
            let recipe = load_recipe(&index, &config, &tool)?;
            let (policy, linux) = classify_recipe(&recipe);

            output::info(&format!("{}: linux family policy {}", tool.bold(), policy));
            for entry in &linux {
                match &entry.linux_family {
                    Some(family) => output::detail(&format!("{} ({})", entry.os, family)),
                    None => output::detail(&format!("{} (any family)", entry.os)),
                }
            }
            let targets = plan_targets(&recipe);
            if targets.is_empty() {
                output::warning("recipe has no supported targets");
            }
            for target in targets {
                println!("  {} {}", "-".cyan(), target);
            }
        }

        Commands::Deps { tool, os } => {
            let index = open_index(&config);
            let recipe = load_recipe(&index, &config, &tool)?;
            let mut resolver = Resolver::new(&index);
            if let Some(os) = &os {
                resolver = resolver.for_os(os);
            }
            let graph = resolver.expand(&recipe)?;
            let (install_time, runtime) = graph.requirements();

            for (label, set) in [("Install-time", &install_time), ("Runtime", &runtime)] {
                output::info(&format!("{} dependencies for {}:", label, tool.bold()));
                if set.is_empty() {
                    println!("  {}", "(none)".dimmed());
                }
                for decl in set.iter() {
                    println!("  {} {}", "-".cyan(), decl);
                }
            }

            let order = graph.install_order()?;
            if !order.is_empty() {
                output::info("Install order:");
                for (i, name) in order.iter().enumerate() {
                    println!("  {}. {}", i + 1, name);
                }
            }
        }

        Commands::Activate { tool, version } => {
            installer::switch_version(&config, &tool, &version)?;
            output::success(&format!("{} {} is now active", tool, version));
        }

        Commands::Remove { tool, version } => {
            let report = installer::remove(&config, &tool, version.as_deref())?;
            for version in &report.removed_versions {
                output::success(&format!("Removed {} {}", tool, version));
            }
            if let Some(active) = &report.active_version {
                output::detail(&format!("active version is now {}", active));
            }
            if !report.required_by.is_empty() {
                output::warning(&format!(
                    "{} is still required by: {}",
                    tool,
                    report.required_by.join(", ")
                ));
            }
        }

        Commands::List => {
            let state = StateManager::from_config(&config).load()?;
            if state.installed.is_empty() {
                output::info("No tools installed");
                return Ok(());
            }

            let (explicit, dependencies): (Vec<_>, Vec<_>) =
                state.installed.iter().partition(|(_, t)| t.is_explicit);
            for (heading, group) in [("Installed tools:", explicit), ("Dependencies:", dependencies)]
            {
                if group.is_empty() {
                    continue;
                }
                output::info(heading);
                for (name, record) in group {
                    let note = if record.required_by.is_empty() {
                        String::new()
                    } else {
                        let users: Vec<&str> =
                            record.required_by.iter().map(String::as_str).collect();
                        format!("(required by {})", users.join(", "))
                    };
                    output::tool_item(name, &note);
                    for version in record.installed_versions() {
                        output::version_item(&version, version == record.active_version);
                    }
                }
            }
        }

        Commands::Verify { tool } => {
            let index = open_index(&config);
            let recipe = load_recipe(&index, &config, &tool)?;
            let state = StateManager::from_config(&config).load()?;

            let pb = output::spinner(&format!("verifying {}", tool));
            match Verifier::default()
                .verify_active(&config, &state, &recipe)
                .and_then(|outcome| outcome.into_result())
            {
                Ok(outcome) => {
                    output::progress_success(pb, &format!("{} verified", tool));
                    if let Some(version) = outcome.transformed_version {
                        output::detail(&format!("matched {}", version));
                    }
                }
                Err(e) => {
                    output::progress_fail(pb, &format!("{} failed verification", tool));
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

/// Host target with any `--os`/`--arch`/`--family` overrides applied.
fn plan_target(
    config: &Config,
    os: Option<String>,
    arch: Option<String>,
    family: Option<String>,
) -> Result<Target> {
    let host = default_target(config);
    let os = os.unwrap_or(host.os.clone());
    let arch = arch.unwrap_or(host.arch.clone());
    if !is_known_os(&os) {
        bail!("unsupported OS '{}'", os);
    }
    if !is_known_arch(&arch) {
        bail!("unsupported architecture '{}'", arch);
    }

    let mut target = Target::new(os, arch);
    if target.is_linux() {
        target.linux_family = match family {
            Some(f) if !is_known_family(&f) => bail!("unknown Linux family '{}'", f),
            Some(f) => Some(f),
            None if host.is_linux() => host.linux_family,
            None => None,
        };
    } else if family.is_some() {
        bail!("--family only applies to linux targets");
    }
    Ok(target)
}
