//! 🚀 dpx: the command line front door to dumpex.
//!
//! Loads config, sets up logging, runs the startup sequence (health wait, index
//! bootstrap, recovery sweep) and then does the one thing you asked for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dpx::{DeleteOutcome, Hub, JobOutcome, Status};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Debug, Parser)]
#[command(name = "dpx", version, about = "Ingest, search and delete text dumps in Elasticsearch")]
struct Cli {
    /// TOML config file. Missing is fine if DPX_* env vars cover it.
    #[arg(short, long, env = "DPX_CONFIG", default_value = "dpx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest one dump file and wait for it to finish
    Ingest {
        file: PathBuf,
        /// `{<start line>}{<separator>}`, e.g. `{1}{:}`
        #[arg(short, long)]
        pattern: String,
        /// 0-based columns to keep, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        columns: Vec<usize>,
        /// Name to record for the file (defaults to the file's own name)
        #[arg(long)]
        filename: Option<String>,
    },
    /// Delete a file's records and status entry by checksum
    Delete { checksum: String },
    /// List status entries, busiest first
    Status {
        #[arg(long, default_value_t = 0)]
        from: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
    },
    /// Phrase search across records; `*` lists everything
    Search {
        query: String,
        #[arg(long, default_value_t = 0)]
        from: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
    },
    /// Run the startup sequence only (health wait, bootstrap, recovery sweep)
    Sweep,
}

fn display_name(file: &Path, filename: Option<String>) -> String {
    filename.unwrap_or_else(|| {
        file.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string())
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = cli.config.as_path();
    let config_file = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Could not check whether the config file exists. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => {
            info!("🔧 no config file at '{}', using environment only", config_file.display());
            None
        }
    };
    let app_config = dpx::load_config(config_file).context("💀 Couldn't load the configuration")?;

    let hub = Hub::start(&app_config).await?;

    match cli.command {
        Command::Ingest {
            file,
            pattern,
            columns,
            filename,
        } => {
            let name = display_name(&file, filename);
            let report = hub.start_ingestion(&file, &pattern, &columns, name)?.wait().await?;
            println!("{}", render::job_report_table(&report));
            match report.outcome {
                JobOutcome::Finished(Status::Complete) => {}
                other => bail!("💀 Ingestion of '{}' did not complete: {other}", file.display()),
            }
        }
        Command::Delete { checksum } => match hub.delete_all_for(&checksum).await? {
            DeleteOutcome::Deleted { records } => println!("🗑️ deleted {checksum} and {records} records"),
            other => bail!("💀 Deletion of '{checksum}' {other}"),
        },
        Command::Status { from, size } => {
            let page = hub.list_status(from, size).await?;
            println!("{}", render::status_table(&page, from));
        }
        Command::Search { query, from, size } => {
            let page = hub.search(&query, from, size).await?;
            println!("{}", render::records_table(&page, from));
        }
        Command::Sweep => {
            println!("🧹 startup sweep done, {} entries moved to error", hub.recovered_on_startup());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        let mut smells_like_connection_trouble = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("Connection refused")
                || cause_str.contains("connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                smells_like_connection_trouble = true;
            }
        }
        if smells_like_connection_trouble {
            error!(
                "🔧 hint: Elasticsearch isn't reachable. Check `elasticsearch.url`, and if it runs \
                 in Docker, `docker ps` shows whether it is actually up."
            );
        }
        std::process::exit(1);
    }
}
