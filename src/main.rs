//! Tandem CLI - Main entry point.

use chrono::Utc;
use tandem::cli::{resolve_state_file, Cli, Commands, StateCommands};
use tandem::config::ClusterConfig;
use tandem::observability;
use tandem::scheduling::CronExpr;
use tandem::state::{self, FileStateStore, StateStore};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = cli.load_config()?;
    config.observability.log_level = cli.log_level.clone();
    observability::init(&config.observability)?;

    match cli.command {
        Commands::Validate => validate(&config),

        Commands::State { command } => match command {
            StateCommands::Show { state_file } => {
                let path = resolve_state_file(state_file.as_deref(), &config)?;
                let records = FileStateStore::new(path).records()?;
                if records.is_empty() {
                    println!("No persisted state in {}", path.display());
                }
                for (cluster, record) in records {
                    let active = state::decode(&record);
                    println!("{}: {} active", cluster, active.len());
                    for id in active {
                        println!("  {}", id);
                    }
                }
                Ok(())
            }
            StateCommands::Clear {
                cluster,
                state_file,
            } => {
                let path = resolve_state_file(state_file.as_deref(), &config)?;
                let cluster = cluster.unwrap_or_else(|| config.id.clone());
                FileStateStore::new(path).remove(&cluster)?;
                println!("Cleared persisted state of {}", cluster);
                Ok(())
            }
        },

        Commands::Schedule { count } => {
            preview("failure detection", config.failure_detection_cron()?, count);
            preview("auto activation", config.auto_activation_cron()?, count);
            Ok(())
        }

        Commands::Version => {
            println!("tandem {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate(config: &ClusterConfig) -> anyhow::Result<()> {
    config.validate()?;

    println!("Cluster:    {}", config.id);
    println!("Balancer:   {:?}", config.balancer);
    println!("Strategy:   {}", config.default_sync_strategy);
    println!(
        "Pool:       {}..{} threads, {}s idle",
        config.pool.min_threads, config.pool.max_threads, config.pool.max_idle
    );
    println!("Databases:  {}", config.databases.len());
    for database in &config.databases {
        println!("  {} (weight {}) {}", database.id, database.weight, database.url);
    }
    Ok(())
}

fn preview(name: &str, schedule: Option<CronExpr>, count: usize) {
    let Some(cron) = schedule else {
        println!("{}: not scheduled", name);
        return;
    };

    println!("{} ({}):", name, cron);
    let mut at = Utc::now();
    for _ in 0..count {
        match cron.next_run(&at) {
            Some(next) => {
                println!("  {}", next.to_rfc3339());
                at = next;
            }
            None => {
                println!("  no further runs");
                break;
            }
        }
    }
}
