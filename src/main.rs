use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use action_flow::Flow;
use action_primitives::ScriptedActuator;
use anyhow::{bail, Context, Result};
use browserflow_cli::{init_tracing, load_policy, Engine, TelemetryOptions};
use browserflow_policy_center::PolicySnapshot;
use browserflow_scheduler::{
    SharedActuator, StaticEnvironmentProvider, TaskPriority, TaskSnapshot, TaskStatus,
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "browserflow", version, about = "Browser automation flow engine")]
struct Cli {
    /// Policy file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also write daily-rolling log files here
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Policy overrides as path=value, repeatable
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Override the scheduler worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow file for structural errors
    Validate {
        /// Flow JSON file
        flow: PathBuf,
    },

    /// Re-serialise a flow file in canonical form
    Normalize {
        flow: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a flow through the scheduler
    Run(RunArgs),

    /// Policy inspection
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Show build information
    Version,
}

#[derive(Args)]
struct RunArgs {
    flow: PathBuf,

    /// Browser profile the task runs against
    #[arg(short, long, default_value = "local")]
    target: String,

    /// Task priority (low, normal, high, critical)
    #[arg(short, long, default_value = "normal")]
    priority: String,

    /// Drive the in-memory page model instead of a browser
    #[arg(long)]
    dry_run: bool,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Print the effective policy
    Show {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&TelemetryOptions {
        level: Some(cli.log_level.clone()),
        json: cli.log_json,
        log_dir: cli.log_dir.clone(),
    })?;

    let result = match cli.command {
        Commands::Validate { ref flow } => cmd_validate(flow),
        Commands::Normalize { ref flow, ref output } => cmd_normalize(flow, output.as_ref()),
        Commands::Run(ref args) => cmd_run(&cli, args).await,
        Commands::Policy {
            action: PolicyAction::Show { json },
        } => cmd_policy_show(&cli, json),
        Commands::Version => cmd_version(),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let flow = Flow::load(path).with_context(|| format!("failed to read {}", path.display()))?;
    let blocks = flow
        .validate()
        .with_context(|| format!("flow '{}' is invalid", flow.name))?;
    println!(
        "✓ {} ({} steps, {} blocks)",
        flow.name,
        flow.steps.len(),
        blocks.block_count()
    );
    Ok(())
}

fn cmd_normalize(path: &Path, output: Option<&PathBuf>) -> Result<()> {
    let flow = Flow::load(path).with_context(|| format!("failed to read {}", path.display()))?;
    match output {
        Some(out) => {
            flow.save(out)
                .with_context(|| format!("failed to write {}", out.display()))?;
            info!(path = %out.display(), "flow written");
        }
        None => println!("{}", flow.to_json()?),
    }
    Ok(())
}

async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let flow = Flow::load(&args.flow)
        .with_context(|| format!("failed to read {}", args.flow.display()))?;
    let priority: TaskPriority = args.priority.parse()?;

    if !args.dry_run {
        bail!("no browser binding is built into this binary; pass --dry-run");
    }
    let snapshot = load_policy(cli.config.as_deref(), &policy_overrides(cli))?;

    let actuator = Arc::new(ScriptedActuator::permissive());
    let engine = Engine::new(
        snapshot,
        Arc::new(StaticEnvironmentProvider::permissive()),
        Arc::new(SharedActuator::new(actuator.clone())),
    );
    engine.start();

    let id = engine.submit_task(args.target.clone(), flow, priority)?;
    info!(task_id = %id, target = %args.target, "task submitted");
    let snapshot = engine.wait_for_task(&id).await?;
    engine.shutdown_within(Duration::from_secs(5)).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot, actuator.calls().len());
    }

    if snapshot.status != TaskStatus::Completed {
        bail!(
            "task {} finished as {}{}",
            snapshot.id,
            snapshot.status,
            snapshot
                .error
                .as_deref()
                .map(|err| format!(": {err}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_summary(snapshot: &TaskSnapshot, actuator_calls: usize) {
    println!("Task {} [{}]", snapshot.id, snapshot.status);
    println!("  Flow:      {}", snapshot.flow_name);
    println!("  Target:    {}", snapshot.target);
    let Some(result) = &snapshot.result else {
        return;
    };
    println!(
        "  Steps:     {}/{} completed",
        result.completed_step_count, result.total_steps
    );
    println!("  Duration:  {}ms", result.duration_ms);
    println!("  Actuator:  {actuator_calls} calls");
    for step in &result.step_results {
        let mark = if step.success { "✓" } else { "✗" };
        println!(
            "    {mark} #{:<3} {:<20} {:?} (attempts: {})",
            step.index, step.step_id, step.status, step.attempts
        );
    }
    if !result.variables.is_empty() {
        println!("  Variables:");
        for (name, value) in &result.variables {
            println!("    {name} = {value}");
        }
    }
}

fn policy_overrides(cli: &Cli) -> Vec<String> {
    let mut overrides = cli.overrides.clone();
    if let Some(workers) = cli.workers {
        overrides.push(format!("scheduler.worker_count={workers}"));
    }
    overrides
}

fn cmd_policy_show(cli: &Cli, json: bool) -> Result<()> {
    let snapshot = load_policy(cli.config.as_deref(), &policy_overrides(cli))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_policy(&snapshot)
}

fn print_policy(snapshot: &PolicySnapshot) -> Result<()> {
    println!("Policy revision {}", snapshot.rev);
    let tree = serde_json::to_value(snapshot)?;
    let Some(sections) = tree.as_object() else {
        return Ok(());
    };
    for (section, values) in sections {
        let Some(values) = values.as_object() else {
            continue;
        };
        if section == "provenance" {
            continue;
        }
        println!("[{section}]");
        print_leaves(snapshot, section, values);
    }
    Ok(())
}

fn print_leaves(
    snapshot: &PolicySnapshot,
    prefix: &str,
    values: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in values {
        let path = format!("{prefix}.{key}");
        match value.as_object() {
            Some(nested) => print_leaves(snapshot, &path, nested),
            None => {
                let source = snapshot
                    .source_of(&path)
                    .map(|source| format!("{source:?}").to_lowercase())
                    .unwrap_or_else(|| "builtin".to_string());
                println!("  {path} = {value}  ({source})");
            }
        }
    }
}

fn cmd_version() -> Result<()> {
    println!("browserflow v{}", env!("CARGO_PKG_VERSION"));
    println!("Build Date: {}", env!("BUILD_DATE"));
    println!("Git Commit: {}", env!("GIT_HASH"));
    println!("Git Branch: {}", env!("GIT_BRANCH"));
    Ok(())
}
