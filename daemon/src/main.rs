use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use botvisor_daemon::{SupervisorClient, SupervisorHandler, SupervisorServer};
use botvisor_shared::logging::{set_log_file, set_log_level};
use botvisor_shared::{log_system, BotConfig, Config, ProcessRecord, Response};
use botvisor_supervisor::{Supervisor, SupervisorOptions};

#[derive(Parser)]
#[command(name = "botvisor")]
#[command(about = "Supervise generated trading-bot processes and track their live state")]
#[command(version)]
struct Cli {
    /// Config file path (default: auto-detect .botvisor/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and accept requests
    Serve,
    /// Start a bot from a JSON config file
    Start {
        /// Bot config (JSON, camelCase keys)
        bot_config: PathBuf,
    },
    /// List all supervised bots
    List,
    /// Show one bot record as JSON
    Get { process_key: String },
    /// Kill a bot and remove its record
    Stop { process_key: String },
    /// Stop and start a bot with its saved config
    Restart { process_key: String },
    /// Print a sample config.toml
    ConfigSample,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::ConfigSample = cli.command {
        let sample = toml::to_string_pretty(&Config::sample())
            .context("Failed to serialize sample config")?;
        print!("{sample}");
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.verbose = true;
    }
    init_logging(&config)?;

    let client = SupervisorClient::new(config.to_connection_config());
    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Start { bot_config } => {
            let bot_config = read_bot_config(&bot_config).await?;
            report(client.start(bot_config).await?, print_record)
        }
        Commands::List => report(client.list().await?, print_records),
        Commands::Get { process_key } => report(client.get(&process_key).await?, print_json),
        Commands::Stop { process_key } => report(client.stop(&process_key).await?, |_| Ok(())),
        Commands::Restart { process_key } => {
            report(client.restart(&process_key).await?, print_record)
        }
        Commands::ConfigSample => Ok(()),
    }
}

fn init_logging(config: &Config) -> Result<()> {
    set_log_level(config.logging.effective_level());
    if let Some(ref log_file) = config.logging.log_file {
        set_log_file(log_file)
            .with_context(|| format!("Failed to open log file: {}", log_file.display()))?;
    }
    Ok(())
}

/// supervisor とサーバーを起動し、終了シグナルまで待つ
async fn serve(config: Config) -> Result<()> {
    let options = SupervisorOptions::from_config(&config);
    log_system!(
        info,
        "Starting supervisor (registry: {}, interpreter: {})",
        options.registry_path.display(),
        config.runtime.interpreter
    );

    let supervisor = Supervisor::start(options)
        .await
        .context("Failed to start supervisor")?;
    let handler = Arc::new(SupervisorHandler::new(supervisor.clone()));
    let server = SupervisorServer::bind(&config.to_connection_config(), handler).await?;

    let result = server.run().await;

    // 子プロセスは止めない
    supervisor.shutdown().await;
    log_system!(info, "Supervisor stopped; bot processes keep running");
    result
}

async fn read_bot_config(path: &Path) -> Result<BotConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read bot config: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse bot config: {}", path.display()))
}

/// 成功ならデータを表示、失敗ならステータス付きのエラーにする
fn report(response: Response, print: impl FnOnce(&Response) -> Result<()>) -> Result<()> {
    if !response.success {
        return Err(anyhow!("{} (status {})", response.message, response.status_code));
    }
    println!("✅ {}", response.message);
    print(&response)
}

fn print_json(response: &Response) -> Result<()> {
    if let Some(ref data) = response.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}

fn print_record(response: &Response) -> Result<()> {
    if let Some(record) = response.data_as::<ProcessRecord>() {
        println!("{}", summary_line(&record));
    }
    Ok(())
}

fn print_records(response: &Response) -> Result<()> {
    let records = response.data_as::<Vec<ProcessRecord>>().unwrap_or_default();
    if records.is_empty() {
        println!("No bots are supervised.");
        return Ok(());
    }
    for record in &records {
        println!("{}", summary_line(record));
    }
    Ok(())
}

fn summary_line(record: &ProcessRecord) -> String {
    let pid = record
        .pid
        .map(|pid| format!("pid {pid}"))
        .unwrap_or_else(|| "-".to_string());
    let price = record
        .state
        .current_price
        .map(|p| format!("price {p}"))
        .unwrap_or_else(|| "price -".to_string());
    let updated = record
        .last_updated
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S");

    let mut line = format!(
        "{} {:<20} {:<12} {:<10} {} trades {} PnL {:.2} (updated {updated})",
        record.status.icon(),
        record.process_key(),
        record.config.symbol,
        pid,
        price,
        record.performance.total_trades,
        record.performance.total_pnl,
    );
    if !record.error.is_empty() {
        line.push_str(&format!("\n    ⚠ {}", record.error));
    }
    line
}
