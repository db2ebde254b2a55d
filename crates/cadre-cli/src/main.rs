mod config;
mod config_watcher;

use cadre_agent::{AgentRuntime, ConfigStore, EchoCapability, FileConfigStore, TemplateRegistry};
use cadre_core::OrganizationId;
use cadre_orchestrator::{
    ChannelSink, Orchestrator, OrchestratorEvent, TaskState, WorkflowSpec, WorkflowState,
};
use clap::{Parser, Subcommand};
use config::CadreConfig;
use config_watcher::ConfigWatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadre", about = "Cadre: workflow orchestration for AI executive agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadre.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a workflow and print its events as JSON lines until it finishes
    Run {
        /// Organization that owns the workflow
        #[arg(long)]
        org: String,
        /// Workflow spec (JSON)
        #[arg(short, long)]
        workflow: PathBuf,
        /// Re-apply [[agents]] whenever the config file changes
        #[arg(long)]
        watch: bool,
    },
    /// List the configured agents of an organization
    Agents {
        #[arg(long)]
        org: String,
    },
    /// List the built-in templates
    Templates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Templates => list_templates(),
        Commands::Agents { org } => {
            let config = config::load(&cli.config).await?;
            let store = open_store(&config).await?;
            list_agents(&store, &OrganizationId::new(org)).await?;
        }
        Commands::Run {
            org,
            workflow,
            watch,
        } => {
            let config = config::load(&cli.config).await?;
            run(&cli.config, config, OrganizationId::new(org), &workflow, watch).await?;
        }
    }

    Ok(())
}

/// Open the file store and apply the configured agents.
async fn open_store(config: &CadreConfig) -> anyhow::Result<Arc<FileConfigStore>> {
    let store = Arc::new(FileConfigStore::new(config.agents_dir()).await?);
    let changed = config::seed_agents(store.as_ref(), &config.agents).await?;

    let templates = TemplateRegistry::with_defaults();
    for agent in &config.agents {
        if templates.get(&agent.template_id).is_none() {
            warn!(agent = %agent.key(), "Agent uses an unknown template and cannot run tasks");
        }
    }
    info!(
        agents = config.agents.len(),
        changed = changed.len(),
        dir = %config.agents_dir().display(),
        "Agent store ready"
    );
    Ok(store)
}

async fn run(
    config_path: &Path,
    config: CadreConfig,
    organization_id: OrganizationId,
    workflow: &Path,
    watch: bool,
) -> anyhow::Result<()> {
    let spec_str = tokio::fs::read_to_string(workflow).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read workflow file '{}': {}",
            workflow.display(),
            e
        )
    })?;
    let spec: WorkflowSpec = serde_json::from_str(&spec_str)?;

    let store = open_store(&config).await?;
    let runtime = AgentRuntime::new(TemplateRegistry::with_defaults(), Arc::new(EchoCapability));
    let (sink, mut events) = ChannelSink::new();
    let orchestrator = Orchestrator::new(store, runtime, Arc::new(sink), config.orchestrator);

    let _watcher = if watch {
        Some(watch_agents(config_path, orchestrator.clone())?)
    } else {
        None
    };

    let workflow_id = orchestrator.submit(organization_id, spec)?;

    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if let OrchestratorEvent::WorkflowUpdated(update) = &event {
            if update.workflow_id == workflow_id && update.state.is_terminal() {
                break;
            }
        }
    }

    let snapshot = orchestrator.workflow(workflow_id)?;
    orchestrator.shutdown().await;

    let failed = snapshot
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .count();
    info!(
        workflow_id = %workflow_id,
        state = %snapshot.state,
        tasks = snapshot.tasks.len(),
        failed,
        "Workflow finished"
    );
    if snapshot.state != WorkflowState::Completed {
        anyhow::bail!("workflow {workflow_id} ended {}", snapshot.state);
    }
    Ok(())
}

/// Re-seed agents on config changes and drop stale handles.
fn watch_agents(config_path: &Path, orchestrator: Orchestrator) -> anyhow::Result<ConfigWatcher> {
    let runtime = tokio::runtime::Handle::current();
    let watcher = ConfigWatcher::start(config_path.to_path_buf(), 500, move |reloaded| {
        let orchestrator = orchestrator.clone();
        runtime.spawn(async move {
            let directory = orchestrator.directory();
            match config::seed_agents(directory.store().as_ref(), &reloaded.agents).await {
                Ok(changed) => {
                    for key in &changed {
                        directory.invalidate(key);
                    }
                    info!(changed = changed.len(), "Agents reloaded");
                }
                Err(e) => warn!(error = %e, "Agent reload failed"),
            }
        });
    })?;
    Ok(watcher)
}

async fn list_agents(store: &FileConfigStore, organization_id: &OrganizationId) -> anyhow::Result<()> {
    let agents = store.list(organization_id).await?;
    if agents.is_empty() {
        println!("No agents configured for '{organization_id}'.");
        println!("Add them to cadre.toml under [[agents]]");
        return Ok(());
    }
    println!("Agents of '{organization_id}':");
    for agent in &agents {
        println!(
            "  {:<6} {} (revision {})",
            agent.template_id.as_str(),
            agent.name,
            agent.revision
        );
        if let Some(tone) = agent.trait_str("tone") {
            println!("         tone: {tone}");
        }
        for (goal, target) in &agent.goals {
            println!("         goal {goal}: {target}");
        }
    }
    println!("\nTotal: {} agent(s)", agents.len());
    Ok(())
}

fn list_templates() {
    let templates = TemplateRegistry::with_defaults();
    println!("Built-in templates:");
    for template in templates.list() {
        println!("  {:<6} {}", template.id.as_str(), template.title);
        println!("         capabilities: {}", template.capabilities.join(", "));
        if template.accepted_kinds.is_empty() {
            println!("         accepts: any kind");
        } else {
            println!("         accepts: {}", template.accepted_kinds.join(", "));
        }
    }
    println!("\nTotal: {} template(s)", templates.len());
}
