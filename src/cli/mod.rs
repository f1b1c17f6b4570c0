//! CLI subcommands — init, validate, plan, apply, destroy, output, status.

use crate::core::error::EngineError;
use crate::core::executor::{self, ExecOptions};
use crate::core::loader;
use crate::core::planner::{self, PlanOptions};
use crate::core::schema::Catalog;
use crate::core::state::StateStore;
use crate::core::types::{ActionKind, ApplyReport, AttrValue, Plan, RecordStatus, ResourceGraph};
use crate::provider::memory::MemoryProvider;
use crate::provider::AdapterRegistry;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stratus project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stratus.yaml without contacting the provider
    Validate {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,
    },

    /// Show the reconciliation plan (diff desired vs recorded state)
    Plan {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Skip the provider refresh pass (diff against recorded state only)
        #[arg(long)]
        no_refresh: bool,
    },

    /// Converge provider resources to the declared state
    Apply {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Maximum provider calls in flight at once
        #[arg(long, default_value_t = 4)]
        parallel: usize,

        /// Skip the provider refresh pass
        #[arg(long)]
        no_refresh: bool,

        /// Show what would be applied without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete every managed resource, dependents first
    Destroy {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Maximum provider calls in flight at once
        #[arg(long, default_value_t = 4)]
        parallel: usize,
    },

    /// Show recorded output attributes
    Output {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this node
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Show recorded state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command, returning the process exit code.
pub async fn dispatch(cmd: Commands) -> Result<i32, EngineError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            file,
            state_dir,
            no_refresh,
        } => cmd_plan(&file, &state_dir, no_refresh).await,
        Commands::Apply {
            file,
            state_dir,
            parallel,
            no_refresh,
            dry_run,
        } => cmd_apply(&file, &state_dir, parallel, no_refresh, dry_run).await,
        Commands::Destroy {
            file,
            state_dir,
            parallel,
        } => cmd_destroy(&file, &state_dir, parallel).await,
        Commands::Output { state_dir, node } => cmd_output(&state_dir, node.as_deref()),
        Commands::Status { state_dir } => cmd_status(&state_dir),
    }
}

/// The local control plane: an in-memory provider persisted under the state
/// directory so successive commands see the same resources.
fn backend(state_dir: &Path) -> Result<(Catalog, AdapterRegistry), EngineError> {
    let catalog = Catalog::example();
    let provider = MemoryProvider::with_persistence(
        catalog.clone(),
        state_dir.join("control-plane.yaml"),
    )
    .map_err(|e| EngineError::Provider {
        kind: "memory".to_string(),
        source: e,
    })?;
    let registry = AdapterRegistry::memory_backed(&catalog, Arc::new(provider));
    Ok((catalog, registry))
}

fn cmd_init(path: &Path) -> Result<i32, EngineError> {
    let config_path = path.join("stratus.yaml");
    if config_path.exists() {
        return Err(EngineError::Parse(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)?;

    let template = r#"version: "1.0"
name: my-infrastructure
description: "Managed by stratus"

provider:
  region: local

resources: {}
"#;
    std::fs::write(&config_path, template)?;

    println!("Initialized stratus project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(0)
}

fn cmd_validate(file: &Path) -> Result<i32, EngineError> {
    let catalog = Catalog::example();
    let (decl, graph) = loader::load_file(file, &catalog)?;
    println!("OK: {} ({} resources)", decl.name, graph.nodes.len());
    Ok(0)
}

async fn cmd_plan(file: &Path, state_dir: &Path, no_refresh: bool) -> Result<i32, EngineError> {
    let (catalog, registry) = backend(state_dir)?;
    let (_decl, graph) = loader::load_file(file, &catalog)?;
    let store = StateStore::new(state_dir);
    let states = store.load_all()?;

    let plan = planner::plan(
        &graph,
        &catalog,
        &states,
        &registry,
        &PlanOptions {
            refresh: !no_refresh,
        },
    )
    .await?;

    print_plan(&plan);
    Ok(if plan.has_changes() { 2 } else { 0 })
}

async fn cmd_apply(
    file: &Path,
    state_dir: &Path,
    parallel: usize,
    no_refresh: bool,
    dry_run: bool,
) -> Result<i32, EngineError> {
    let (catalog, registry) = backend(state_dir)?;
    let (_decl, graph) = loader::load_file(file, &catalog)?;
    converge(&catalog, &registry, &graph, state_dir, parallel, no_refresh, dry_run).await
}

async fn cmd_destroy(file: &Path, state_dir: &Path, parallel: usize) -> Result<i32, EngineError> {
    let (catalog, registry) = backend(state_dir)?;
    let (decl, _graph) = loader::load_file(file, &catalog)?;
    // Destroy is converging toward an empty graph of the same name.
    let graph = ResourceGraph::empty(&decl.name);
    converge(&catalog, &registry, &graph, state_dir, parallel, false, false).await
}

async fn converge(
    catalog: &Catalog,
    registry: &AdapterRegistry,
    graph: &ResourceGraph,
    state_dir: &Path,
    parallel: usize,
    no_refresh: bool,
    dry_run: bool,
) -> Result<i32, EngineError> {
    let store = StateStore::new(state_dir);
    let states = store.load_all()?;

    let plan = planner::plan(
        graph,
        catalog,
        &states,
        registry,
        &PlanOptions {
            refresh: !no_refresh,
        },
    )
    .await?;
    print_plan(&plan);

    if dry_run {
        println!("Dry run — no changes applied.");
        return Ok(0);
    }
    if !plan.has_changes() {
        return Ok(0);
    }

    let report = executor::apply(
        &plan,
        registry,
        &store,
        &ExecOptions {
            max_parallel: parallel,
            record_events: true,
        },
        None,
    )
    .await?;

    print_report(&report);
    Ok(if report.all_applied() { 0 } else { 1 })
}

/// Display a plan to stdout.
fn print_plan(plan: &Plan) {
    println!("Planning: {} ({} actions)", plan.name, plan.actions.len());
    println!();

    for finding in &plan.drift {
        println!("  DRIFTED: {} ({})", finding.node_id, finding.detail);
        println!("    Recorded: {}", finding.recorded_fingerprint);
        println!("    Observed: {}", finding.observed_fingerprint);
    }
    if !plan.drift.is_empty() {
        println!();
    }

    for action in &plan.actions {
        let symbol = match action.action {
            ActionKind::Create => "+",
            ActionKind::Update => "~",
            ActionKind::Replace => "±",
            ActionKind::Delete => "-",
            ActionKind::NoOp => " ",
        };
        println!("  {} {}", symbol, action.description);
        if matches!(action.action, ActionKind::Update | ActionKind::Replace) {
            for name in &action.changed {
                let rendered = action
                    .attributes
                    .get(name)
                    .map(AttrValue::render)
                    .unwrap_or_else(|| "(removed)".to_string());
                println!("      {} = {}", name, rendered);
            }
        }
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to replace, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_replace, plan.to_delete, plan.unchanged
    );
}

fn print_report(report: &ApplyReport) {
    println!();
    for failure in &report.failed {
        eprintln!("  FAILED: {}: {}", failure.node_id, failure.error);
        for blocked in &failure.blocked_dependents {
            eprintln!("    blocked: {}", blocked);
        }
    }

    if report.all_applied() {
        println!(
            "Apply complete: {} applied, {} unchanged ({:.1}s)",
            report.applied.len(),
            report.unchanged.len(),
            report.total_duration.as_secs_f64()
        );
    } else {
        println!(
            "Apply completed with errors: {} applied, {} unchanged, {} FAILED, {} blocked, {} cancelled ({:.1}s)",
            report.applied.len(),
            report.unchanged.len(),
            report.failed.len(),
            report.blocked.len(),
            report.cancelled.len(),
            report.total_duration.as_secs_f64()
        );
    }
}

fn cmd_output(state_dir: &Path, node_filter: Option<&str>) -> Result<i32, EngineError> {
    let catalog = Catalog::example();
    let store = StateStore::new(state_dir);
    let states = store.load_all()?;

    let mut found = false;
    for (id, record) in &states {
        if let Some(filter) = node_filter {
            if id != filter {
                continue;
            }
        }
        let Some(schema) = catalog.get(&record.kind) else {
            continue;
        };
        if schema.outputs.is_empty() {
            continue;
        }
        found = true;
        println!("{}:", id);
        for output in &schema.outputs {
            if let Some(value) = record.attributes.get(output) {
                let rendered = AttrValue::from_yaml(value)
                    .map(|v| v.render())
                    .unwrap_or_else(|e| format!("(unreadable: {})", e));
                println!("  {} = {}", output, rendered);
            }
        }
    }

    if !found {
        println!("No outputs recorded. Run `stratus apply` first.");
    }
    Ok(0)
}

fn cmd_status(state_dir: &Path) -> Result<i32, EngineError> {
    let store = StateStore::new(state_dir);
    let states = store.load_all()?;

    if states.is_empty() {
        println!("No state found. Run `stratus apply` first.");
        return Ok(0);
    }

    println!("Recorded state: {} node(s)", states.len());
    for (id, record) in &states {
        let status = match record.status {
            RecordStatus::Applied => "applied",
            RecordStatus::Applying => "IN FLIGHT",
        };
        let when = record
            .applied_at
            .as_deref()
            .map(|ts| format!(" at {}", ts))
            .unwrap_or_default();
        println!(
            "  {}: {} [{}] {}{}",
            id, status, record.kind, record.provider_id, when
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_decl(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stratus.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    const SIMPLE: &str = r#"
version: "1.0"
name: test
resources:
  registry:
    kind: registry
    attributes:
      name: api
"#;

    #[test]
    fn test_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("test-project");
        std::fs::create_dir_all(&sub).unwrap();
        assert_eq!(cmd_init(&sub).unwrap(), 0);
        assert!(sub.join("stratus.yaml").exists());
        assert!(sub.join("state").is_dir());
    }

    #[test]
    fn test_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stratus.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_init_template_validates() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        assert_eq!(cmd_validate(&dir.path().join("stratus.yaml")).unwrap(), 0);
    }

    #[test]
    fn test_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(
            dir.path(),
            r#"
version: "1.0"
name: test
resources:
  ghost:
    kind: no-such-kind
    attributes:
      name: x
"#,
        );
        assert!(cmd_validate(&file).is_err());
    }

    #[tokio::test]
    async fn test_plan_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let state = dir.path().join("state");

        // Pending create: diff present, exit 2.
        assert_eq!(cmd_plan(&file, &state, false).await.unwrap(), 2);

        // After apply: empty plan, exit 0.
        assert_eq!(cmd_apply(&file, &state, 4, false, false).await.unwrap(), 0);
        assert_eq!(cmd_plan(&file, &state, false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let state = dir.path().join("state");

        assert_eq!(cmd_apply(&file, &state, 4, false, true).await.unwrap(), 0);
        assert_eq!(cmd_plan(&file, &state, false).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_apply_then_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let state = dir.path().join("state");

        assert_eq!(cmd_apply(&file, &state, 4, false, false).await.unwrap(), 0);
        let store = StateStore::new(&state);
        assert_eq!(store.load_all().unwrap().len(), 1);

        assert_eq!(cmd_destroy(&file, &state, 4).await.unwrap(), 0);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_between_commands() {
        // The persisted control plane makes a second apply a NoOp even
        // through separate command invocations.
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let state = dir.path().join("state");

        cmd_apply(&file, &state, 4, false, false).await.unwrap();
        cmd_apply(&file, &state, 4, false, false).await.unwrap();
        let record = StateStore::new(&state).load("registry").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Applied);
    }

    #[tokio::test]
    async fn test_output_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let state = dir.path().join("state");

        assert_eq!(cmd_output(&state, None).unwrap(), 0);
        assert_eq!(cmd_status(&state).unwrap(), 0);

        cmd_apply(&file, &state, 4, false, false).await.unwrap();
        assert_eq!(cmd_output(&state, Some("registry")).unwrap(), 0);
        assert_eq!(cmd_status(&state).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_plan() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let code = dispatch(Commands::Plan {
            file,
            state_dir: dir.path().join("state"),
            no_refresh: false,
        })
        .await
        .unwrap();
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn test_dispatch_validate() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_decl(dir.path(), SIMPLE);
        let code = dispatch(Commands::Validate { file }).await.unwrap();
        assert_eq!(code, 0);
    }
}
