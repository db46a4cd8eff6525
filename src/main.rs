use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gradebox::config::GraderConfig;
use gradebox::grading::{get_grade, grade_log, GradeLogEntry};
use gradebox::node::GraderNode;
use gradebox::shutdown::install_shutdown_handler;
use gradebox::store::builds::list_builds;
use gradebox::store::{Build, Store};

#[derive(Parser, Debug)]
#[command(name = "gradebox")]
#[command(version)]
#[command(about = "An autograder that runs student code in resource-limited containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the grader: workers, mailer and dashboard
    Server(ServerArgs),

    /// Fail unfinished builds and remove leftover containers, then exit
    Reset {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// List recent builds
    Builds {
        #[command(flatten)]
        config: ConfigArgs,

        /// Only builds of this source
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of builds to show
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Show a user's grade ledger
    Grades {
        #[command(flatten)]
        config: ConfigArgs,

        /// User id
        user: String,

        /// Only this assignment
        #[arg(long)]
        assignment: Option<String>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// YAML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// SQLite database (overrides the configuration file)
    #[arg(long)]
    database: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<GraderConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => GraderConfig::load(path)?,
            None => GraderConfig::default(),
        };
        if let Some(ref database) = self.database {
            config.database_path = database.clone();
        }
        Ok(config)
    }
}

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Number of build workers
    #[arg(long)]
    workers: Option<usize>,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Default Docker image for grading containers
    #[arg(long)]
    image: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct GradesOutput {
    user: String,
    current: Vec<CurrentGrade>,
    ledger: Vec<GradeLogEntry>,
}

#[derive(Serialize)]
struct CurrentGrade {
    assignment: String,
    score: f64,
    slip_units: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn optional<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.config.load()?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config.dashboard_addr = Some(addr);
    }
    if let Some(image) = args.image {
        config.sandbox.image = image;
    }
    init_tracing(config.debug_mode);

    tracing::info!(
        database = %config.database_path.display(),
        workers = config.workers,
        assignments = config.assignments.len(),
        "Starting gradebox"
    );

    let shutdown = install_shutdown_handler();
    let node = GraderNode::from_config(config, shutdown)?;
    node.run().await?;
    Ok(())
}

async fn run_reset(config: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = config.load()?;
    init_tracing(config.debug_mode);
    let node = GraderNode::from_config(config, tokio_util::sync::CancellationToken::new())?;
    let report = node.reset().await?;
    println!("Failed unfinished builds: {}", report.builds);
    println!("Removed containers:       {}", report.containers);
    println!("Removed images:           {}", report.images);
    Ok(())
}

fn print_builds(builds: &[Build], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(builds)?);
        }
        OutputFormat::Table => {
            if builds.is_empty() {
                println!("No builds found.");
                return Ok(());
            }
            println!(
                "{:<24} {:<12} {:<8} {:<16} STARTED",
                "BUILD", "STATUS", "SCORE", "SOURCE"
            );
            println!("{}", "-".repeat(90));
            for build in builds {
                println!(
                    "{:<24} {:<12} {:<8} {:<16} {}",
                    build.name,
                    build.status.to_string(),
                    build.score,
                    build.source,
                    build.started.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

fn run_builds(
    config: ConfigArgs,
    source: Option<String>,
    limit: u32,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config.load()?;
    let store = Store::open(&config.database_path)?;
    let builds = store.read(|conn| list_builds(conn, source.as_deref(), limit))?;
    print_builds(&builds, &output)
}

fn run_grades(
    config: ConfigArgs,
    user: String,
    assignment: Option<String>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config.load()?;
    let store = Store::open(&config.database_path)?;
    let ledger = store.read(|conn| grade_log(conn, &user, assignment.as_deref()))?;

    let mut names: Vec<&str> = config.assignments.iter().map(|a| a.name.as_str()).collect();
    if let Some(ref only) = assignment {
        names.retain(|n| *n == only.as_str());
    }
    let mut current = Vec::new();
    for name in names {
        if let Some(grade) = store.read(|conn| get_grade(conn, &user, name))? {
            current.push(CurrentGrade {
                assignment: grade.assignment,
                score: grade.score,
                slip_units: grade.slip_units,
            });
        }
    }

    match output {
        OutputFormat::Json => {
            let out = GradesOutput {
                user,
                current,
                ledger,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Grades for {}", user);
            println!("{}", "=".repeat(40));
            for grade in &current {
                println!(
                    "{:<16} {:<8} slip units: {}",
                    grade.assignment, grade.score, grade.slip_units
                );
            }
            println!();
            println!("Ledger:");
            println!(
                "{:<24} {:<12} {:<8} {:<6} {:<12} UPDATED",
                "TRANSACTION", "ASSIGNMENT", "SCORE", "SLIP", "SOURCE"
            );
            println!("{}", "-".repeat(90));
            for entry in &ledger {
                println!(
                    "{:<24} {:<12} {:<8} {:<6} {:<12} {}",
                    entry.transaction_name,
                    entry.assignment,
                    optional(&entry.score),
                    optional(&entry.slip_units),
                    optional(&entry.source),
                    entry.updated.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Reset { config } => run_reset(config).await,
        Commands::Builds {
            config,
            source,
            limit,
            output,
        } => run_builds(config, source, limit, output),
        Commands::Grades {
            config,
            user,
            assignment,
            output,
        } => run_grades(config, user, assignment, output),
    }
}
