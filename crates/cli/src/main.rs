mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bus::{AmqpBroker, Broker};
use clap::{Parser, Subcommand};
use cryton_core::{RunState, Worker};
use db::Store;
use orchestrator::Hive;
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use settings::{default_config_path, hive_dir, HiveSettings};

#[derive(Parser)]
#[command(name = "cryton-hive")]
#[command(about = "Attack plan execution engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ~/.cryton/hive.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default settings and create the database
    Init,
    /// Run the hive until interrupted
    Start,
    #[command(subcommand)]
    Plan(PlanCommand),
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Execute a plan on the given workers and wait for the run to end
    Run {
        plan_id: Uuid,
        /// Worker names, one plan execution each
        #[arg(short, long = "worker", required = true)]
        workers: Vec<String>,
        /// Execution variables as a JSON or TOML file
        #[arg(long)]
        variables: Option<PathBuf>,
    },
    /// Print or write the report of a run
    Report {
        run_id: Uuid,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Validate and store a plan document (JSON or TOML)
    Create { file: PathBuf },
    List,
    Delete { plan_id: Uuid },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Register {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    List,
    /// Ask a worker whether it is alive
    Health { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    match cli.command {
        Commands::Init => init(&config_path).await,
        Commands::Start => start(&HiveSettings::load(&config_path).await?).await,
        Commands::Plan(command) => plan(&HiveSettings::load(&config_path).await?, command).await,
        Commands::Worker(command) => worker(&HiveSettings::load(&config_path).await?, command).await,
        Commands::Run {
            plan_id,
            workers,
            variables,
        } => {
            let settings = HiveSettings::load(&config_path).await?;
            run(&settings, plan_id, &workers, variables.as_deref()).await
        }
        Commands::Report { run_id, output } => {
            report(&HiveSettings::load(&config_path).await?, run_id, output.as_deref()).await
        }
    }
}

async fn init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Settings already exist at {}", config_path.display());
    } else {
        HiveSettings::default().save(config_path).await?;
        println!("Wrote {}", config_path.display());
    }

    let settings = HiveSettings::load(config_path).await?;
    Store::connect(&settings.database.url)
        .await
        .with_context(|| format!("Failed to initialize database {}", settings.database.url))?;
    println!("Database ready at {}", settings.database.url);
    Ok(())
}

async fn connect(settings: &HiveSettings) -> Result<Hive> {
    tokio::fs::create_dir_all(hive_dir()).await?;
    let store = Store::connect(&settings.database.url)
        .await
        .context("Failed to open database")?;
    let broker = AmqpBroker::connect(&settings.rabbit.url)
        .await
        .context("Failed to connect to RabbitMQ")?;
    let broker: Arc<dyn Broker> = Arc::new(broker);
    Ok(Hive::new(store, broker, settings.engine_config()?))
}

async fn start(settings: &HiveSettings) -> Result<()> {
    let hive = connect(settings).await?;
    hive.start().await?;
    tracing::info!(database = %settings.database.url, "Hive is running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    hive.shutdown().await;
    Ok(())
}

async fn plan(settings: &HiveSettings, command: PlanCommand) -> Result<()> {
    let hive = connect(settings).await?;
    match command {
        PlanCommand::Create { file } => {
            let document = read_document(&file).await?;
            let plan = hive.creator().create_plan(&document).await?;
            println!("Created plan '{}' ({})", plan.name, plan.id);
        }
        PlanCommand::List => {
            let plans = hive.creator().list_plans().await?;
            if plans.is_empty() {
                println!("No plans yet.");
            }
            for plan in plans {
                let kind = if plan.dynamic { " [dynamic]" } else { "" };
                println!("{}  {}{}  {} stage(s)", plan.id, plan.name, kind, plan.template.stages.len());
            }
        }
        PlanCommand::Delete { plan_id } => {
            hive.creator().delete_plan(plan_id).await?;
            println!("Deleted plan {plan_id}");
        }
    }
    Ok(())
}

async fn worker(settings: &HiveSettings, command: WorkerCommand) -> Result<()> {
    let hive = connect(settings).await?;
    match command {
        WorkerCommand::Register { name, description } => {
            let worker = hive.workers().register(&name, &description).await?;
            println!("Registered worker '{}' ({})", worker.name, worker.id);
        }
        WorkerCommand::List => {
            for worker in hive.workers().list().await? {
                println!("{}  {}  {}", worker.id, worker.name, worker.state.as_str());
            }
        }
        WorkerCommand::Health { name } => {
            let worker = find_worker(&hive, &name).await?;
            let state = hive.workers().health_check(worker.id).await?;
            println!("{}: {}", worker.name, state.as_str());
        }
    }
    Ok(())
}

async fn run(
    settings: &HiveSettings,
    plan_id: Uuid,
    worker_names: &[String],
    variables: Option<&Path>,
) -> Result<()> {
    let hive = connect(settings).await?;
    hive.start().await?;

    let mut worker_ids = Vec::with_capacity(worker_names.len());
    for name in worker_names {
        worker_ids.push(find_worker(&hive, name).await?.id);
    }
    let run = hive.runs().create(plan_id, &worker_ids).await?;

    if let Some(path) = variables {
        let variables = match read_document(path).await? {
            Value::Object(map) => map,
            _ => bail!("{} must contain a table of variables", path.display()),
        };
        add_variables(&hive, run.id, &variables).await?;
    }

    hive.runs().execute(run.id).await?;
    println!("Run {} started", run.id);

    let state = tokio::select! {
        state = wait_for_end(&hive, run.id) => state?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, killing run {}", run.id);
            hive.runs().kill(run.id).await?;
            RunState::Terminated
        }
    };
    println!("Run {} ended {}", run.id, state.as_str());

    let report = hive.runs().report(run.id).await?;
    println!("{}", orchestrator::export_report(&report, None).await?);
    hive.shutdown().await;
    Ok(())
}

async fn add_variables(hive: &Hive, run_id: Uuid, variables: &Map<String, Value>) -> Result<()> {
    for execution in hive.store().plan_executions.find_by_run(run_id).await? {
        hive.creator()
            .add_execution_variables(execution.id, variables)
            .await?;
    }
    Ok(())
}

async fn wait_for_end(hive: &Hive, run_id: Uuid) -> Result<RunState> {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        let run = hive.runs().get(run_id).await?;
        if run.state.is_final() {
            return Ok(run.state);
        }
    }
}

async fn report(settings: &HiveSettings, run_id: Uuid, output: Option<&Path>) -> Result<()> {
    let hive = connect(settings).await?;
    let report = hive.runs().report(run_id).await?;
    let json = orchestrator::export_report(&report, output).await?;
    match output {
        Some(path) => println!("Report written to {}", path.display()),
        None => println!("{json}"),
    }
    Ok(())
}

async fn find_worker(hive: &Hive, name: &str) -> Result<Worker> {
    hive.store()
        .workers
        .find_by_name(name)
        .await?
        .with_context(|| format!("No worker named '{name}'"))
}

/// Parses a JSON document, or TOML when the file ends in `.toml`.
async fn read_document(path: &Path) -> Result<Value> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))?
    } else {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))?
    };
    Ok(document)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cryton_hive=info,orchestrator=info,bus=info,db=warn".into()),
        )
        .init();
}
