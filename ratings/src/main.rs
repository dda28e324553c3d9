//! Entrypoint of the ratings binary
use dotenvy::dotenv;
use ratings_clap_blocks::{logging::LoggingConfig, tokio::TokioIoConfig};

mod commands {
    pub(crate) mod common;
    pub(crate) mod insert;
    pub(crate) mod inspect;
    pub(crate) mod load;
    pub(crate) mod partition;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "ratings",
    version,
    about = "Load, partition and incrementally insert user ratings",
    long_about = r#"Load, partition and incrementally insert user ratings

Examples:
    # Load a ratings file into the `ratings` table of a PostgreSQL catalog
    ratings load --catalog-dsn postgresql://postgres@localhost:5432/postgres --file ratings.dat

    # Split the loaded ratings into 5 range partitions over [0, 5]
    ratings partition range --partitions 5

    # Deal the loaded ratings over 3 round-robin partitions
    ratings partition round-robin --partitions 3

    # Insert one rating into the main table and its range partition
    ratings insert range --user 100 --item 2 --rating 3.5

    # Show the partition sets and the partition tables present
    ratings inspect

    # Try the whole flow in memory; nothing outlives the process
    ratings load --catalog-dsn memory --file ratings.dat --range-partitions 5 --round-robin-partitions 3
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioIoConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Load a `UserID::MovieID::Rating::Timestamp` file into a ratings table
    Load(commands::load::Config),

    /// Rebuild the range or round-robin partitions of a ratings table
    Partition(commands::partition::Config),

    /// Insert a single rating into a ratings table and one of its partitions
    Insert(commands::insert::Config),

    /// Show the partition sets and partition tables in the catalog
    Inspect(commands::inspect::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;
    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Load(config)) => {
                init_logs(&config.common.logging_config);
                if let Err(e) = commands::load::command(config).await {
                    eprintln!("Load command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Partition(config)) => {
                init_logs(&config.common.logging_config);
                if let Err(e) = commands::partition::command(config).await {
                    eprintln!("Partition command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Insert(config)) => {
                init_logs(&config.common.logging_config);
                if let Err(e) = commands::insert::command(config).await {
                    eprintln!("Insert command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Inspect(config)) => {
                init_logs(&config.common.logging_config);
                if let Err(e) = commands::inspect::command(config).await {
                    eprintln!("Inspect command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is not an error
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

fn init_logs(config: &LoggingConfig) {
    if let Err(e) = config.install_global_subscriber() {
        eprintln!("Initializing logs failed: {e}");
        std::process::exit(ReturnCode::Failure as _);
    }
}
