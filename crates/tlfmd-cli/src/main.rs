//! tlfmd: inspect and audit a local metadata store
//!
//! Commands:
//!   status                          - folders, branch heads, device branch records
//!   log --tlf <id> [--branch <bid>] - stored revisions of one branch
//!   audit --tlf <id>                - re-verify every stored chain of a folder
//!   config                          - print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use tlfmd_core::clock::to_unix_millis;
use tlfmd_core::config::TlfmdConfig;
use tlfmd_core::{
    BranchId, CryptPublicKey, NoTeams, RequestContext, Session, StaticSession, SystemClock, TlfId, UserId,
    VerifyingKey,
};
use tlfmd_server::MdServerDisk;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tlfmd",
    version,
    about = "Folder metadata store administration",
    long_about = "tlfmd: inspect folders, revision logs and chain integrity of a local-disk metadata store"
)]
struct Cli {
    /// Path to tlfmd.toml configuration file
    #[arg(long, short = 'c', env = "TLFMD_CONFIG", default_value = "/etc/tlfmd/config.toml")]
    config: PathBuf,

    /// Store snapshot to open (overrides config server.state_path)
    #[arg(long, env = "TLFMD_STATE_PATH")]
    state: Option<PathBuf>,

    /// Log level (overrides config logging.level)
    #[arg(long, env = "TLFMD_LOG")]
    log: Option<String>,

    /// Log format (overrides config logging.format)
    #[arg(long, env = "TLFMD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List folders with their branches and branch records
    Status,

    /// Show the stored revisions of one branch
    Log {
        /// Folder ID (hex)
        #[arg(long)]
        tlf: TlfId,
        /// Branch ID (hex); the merged history when omitted
        #[arg(long)]
        branch: Option<BranchId>,
    },

    /// Re-check signatures and successor links of every stored revision
    Audit {
        /// Folder ID (hex)
        #[arg(long)]
        tlf: TlfId,
    },

    /// Print the effective configuration (defaults merged with the file)
    Config,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None if config.logging.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);
    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Config => cmd_config(&config, &cli.config, found),
        Commands::Status => {
            let store = open_store(&config, cli.state.as_deref()).await?;
            cmd_status(&store).await
        }
        Commands::Log { tlf, branch } => {
            let store = open_store(&config, cli.state.as_deref()).await?;
            cmd_log(&store, tlf, branch.unwrap_or(BranchId::NULL)).await
        }
        Commands::Audit { tlf } => {
            let store = open_store(&config, cli.state.as_deref()).await?;
            cmd_audit(&store, tlf).await
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Parsed config and whether the file existed.
async fn load_config(path: &Path) -> Result<(TlfmdConfig, bool)> {
    if !path.exists() {
        return Ok((TlfmdConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

/// Resolve the snapshot path: CLI flag > config
fn resolve_state_path(config: &TlfmdConfig, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(p) => p.to_path_buf(),
        None => expand_tilde(&config.server.state_path),
    }
}

/// The admin session only reads snapshots.
async fn open_store(config: &TlfmdConfig, override_path: Option<&Path>) -> Result<MdServerDisk> {
    let path = resolve_state_path(config, override_path);
    if !path.exists() {
        anyhow::bail!("no metadata store at {}", path.display());
    }
    let admin = Session {
        uid: UserId::new("tlfmd-admin"),
        name: "tlfmd-admin".into(),
        verifying_key: VerifyingKey::default(),
        crypt_public_key: CryptPublicKey::default(),
    };
    let store = MdServerDisk::open(
        path.clone(),
        config.server.clone(),
        Arc::new(StaticSession(admin)),
        Arc::new(NoTeams),
        Arc::new(SystemClock),
    )
    .await
    .with_context(|| format!("opening metadata store: {}", path.display()))?;
    Ok(store)
}

// ── `tlfmd status` ────────────────────────────────────────────────────────────

async fn cmd_status(store: &MdServerDisk) -> Result<()> {
    let folders = store.folders().await.context("listing folders")?;
    println!("store: {}", store.path().display());
    println!("folders: {}", folders.len());

    for folder in &folders {
        println!();
        match &folder.handle {
            Some(handle) => println!("{}  {}", folder.id, handle),
            None => println!("{}  (no handle)", folder.id),
        }
        if folder.branches.is_empty() {
            println!("  no revisions");
        }
        for branch in &folder.branches {
            let label = if branch.bid.is_null() {
                "merged".to_string()
            } else {
                format!("branch {}", branch.bid)
            };
            println!(
                "  {label:<40} revisions {}..={} ({} blocks)",
                branch.initial_revision, branch.head_revision, branch.blocks
            );
        }
        for (device, bid) in &folder.devices {
            println!("  device {device} -> branch {bid}");
        }
    }
    Ok(())
}

// ── `tlfmd log` ───────────────────────────────────────────────────────────────

async fn cmd_log(store: &MdServerDisk, tlf: TlfId, branch: BranchId) -> Result<()> {
    let blocks = store
        .list_blocks(tlf, branch)
        .await
        .with_context(|| format!("listing revisions of {tlf}"))?;

    println!("{:>8}  {:<64}  {:<64}  {:>14}  {:>6}  user", "rev", "md_id", "prev", "server_ms", "keygen");
    for block in &blocks {
        println!(
            "{:>8}  {:<64}  {:<64}  {:>14}  {:>6}  {}",
            block.revision.to_string(),
            block.md_id.to_string(),
            block.prev_root.to_string(),
            to_unix_millis(block.server_time),
            block.key_gen.to_string(),
            block.last_modifying_user
        );
    }
    Ok(())
}

// ── `tlfmd audit` ─────────────────────────────────────────────────────────────

async fn cmd_audit(store: &MdServerDisk, tlf: TlfId) -> Result<()> {
    let ctx = RequestContext::new();
    let report = store
        .audit(&ctx, tlf)
        .await
        .with_context(|| format!("auditing {tlf}"))?;

    println!("folder {}: {} blocks checked", report.tlf, report.blocks_checked);
    if report.is_clean() {
        println!("  ok");
        return Ok(());
    }
    for finding in &report.findings {
        let branch = if finding.branch.is_null() {
            "merged".to_string()
        } else {
            finding.branch.to_string()
        };
        println!("  {branch} rev {}: {}", finding.revision, finding.problem);
    }
    anyhow::bail!("{} problem(s) found in {tlf}", report.findings.len())
}

// ── `tlfmd config` ────────────────────────────────────────────────────────────

fn cmd_config(config: &TlfmdConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
