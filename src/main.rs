//! certdeploy CLI - deploys a benchmark APK to Android devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use certdeploy::adb::{AdbShell, DeviceShell};
use certdeploy::farm::CommandBackend;
use certdeploy::orchestrator::{create_run_dir, Deployer};
use certdeploy::plan::{DeploymentPlan, Environment};
use certdeploy::recipe::Recipe;

#[derive(Parser)]
#[command(name = "certdeploy")]
#[command(about = "Deploys a benchmark APK to Android devices and collects reports", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a deployment described by a recipe
    Run {
        /// Recipe file path
        #[arg(short, long, default_value = "recipe.toml")]
        recipe: PathBuf,

        /// Path to the packaged APK to deploy
        #[arg(short, long)]
        apk: PathBuf,

        /// Dispatch to the remote device farm instead of local devices
        #[arg(long)]
        farm: bool,

        /// Base output directory for reports and traces
        #[arg(short, long, default_value = "out")]
        out: PathBuf,

        /// Per-device completion deadline in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Workspace root for ${WORKSPACE_DIR} task paths (defaults to
        /// the recipe's directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// List attached devices
    Devices,

    /// Validate a recipe file
    Validate {
        /// Recipe file path
        #[arg(short, long, default_value = "recipe.toml")]
        recipe: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            recipe,
            apk,
            farm,
            out,
            timeout_secs,
            workspace,
        } => run_deployment(&recipe, &apk, farm, &out, timeout_secs, workspace).await,
        Commands::Devices => list_devices().await,
        Commands::Validate { recipe } => validate_recipe(&recipe),
    }
}

async fn run_deployment(
    recipe_path: &Path,
    apk: &Path,
    farm: bool,
    out: &Path,
    timeout_secs: Option<u64>,
    workspace: Option<PathBuf>,
) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let plan = DeploymentPlan::from_recipe(&recipe)?;

    let workspace_dir = match workspace {
        Some(dir) => dir,
        None => recipe_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or(std::env::current_dir()?),
    };
    let env = Environment::new(workspace_dir);

    let out_dir = create_run_dir(out)
        .with_context(|| format!("Failed to create output dir under {}", out.display()))?;
    info!("writing reports to {}", out_dir.display());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; letting in-flight devices finish");
                cancel.cancel();
            }
        });
    }

    let shell = Arc::new(AdbShell::new());
    let deployer = Deployer::new(plan, env, shell, out_dir)
        .with_cancellation(cancel)
        .with_deadline(timeout_secs.map(Duration::from_secs));

    let result = if farm {
        let backend = CommandBackend::from_recipe(&recipe)
            .context("farm deployment requires deployment.farm.command in the recipe")?;
        deployer.run_farm(&recipe, apk, &backend).await?
    } else {
        deployer.run_local(apk).await?
    };

    result.print_summary();
    std::process::exit(result.exit_code());
}

async fn list_devices() -> Result<()> {
    let shell = AdbShell::new();
    let devices = shell.list_devices().await?;

    if devices.is_empty() {
        println!("No devices attached");
    } else {
        println!("Attached devices:");
        for device in devices {
            println!("  {}", device);
        }
    }
    Ok(())
}

fn validate_recipe(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let plan = DeploymentPlan::from_recipe(&recipe)?;

    println!("Recipe is valid!");
    println!();
    println!("Plan:");
    println!("  Package:    {}", plan.package_id);
    if plan.all_attached_devices {
        println!("  Devices:    all attached");
    } else {
        println!("  Devices:    {}", plan.device_ids.join(" "));
    }
    println!("  Systrace:   {}", plan.systrace.enabled);
    if plan.systrace.enabled {
        println!("  Keywords:   {}", plan.systrace.keywords.join(" "));
        println!("  Categories: {}", plan.systrace.categories.join(" "));
    }
    println!("  Preflight:  {} task(s)", plan.preflight.len());
    println!("  Postflight: {} task(s)", plan.postflight.len());
    println!("  Install:    {}", plan.install_apk);

    Ok(())
}
