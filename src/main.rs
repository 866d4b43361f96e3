//! CLI entry point for `mailstash`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use mailstash::config::{self, Config};
use mailstash::export::writer::AttachmentWriter;
use mailstash::parser::{eml, locate};
use mailstash::pipeline::archive::create_archive;
use mailstash::pipeline::decrypt::QpdfDecryptor;
use mailstash::pipeline::{Pipeline, UploadOutcome};
use mailstash::session::imap::ImapConnector;
use mailstash::session::{Orchestrator, OrchestratorSettings, SearchCriteria};

#[derive(Parser)]
#[command(
    name = "mailstash",
    version,
    about = "Fetch, decrypt and archive statement attachments from a mailbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $MAILSTASH_CONFIG or the user config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the mailbox now and then on every schedule interval
    Run,
    /// Run a single poll cycle and exit
    Poll,
    /// List the attachments found in a local .eml file
    Inspect {
        path: PathBuf,
    },
    /// Write the attachments of a local .eml file
    Extract {
        path: PathBuf,
        /// Output directory (default: the staging directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also decrypt, archive and clean up every written file
        #[arg(long)]
        process: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config(),
    };

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Run => cmd_run(&config).await,
        Commands::Poll => cmd_poll(&config).await,
        Commands::Inspect { path } => cmd_inspect(&path),
        Commands::Extract {
            path,
            output,
            process,
        } => cmd_extract(&config, &path, output.as_deref(), process).await,
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = log_path.parent().unwrap_or(Path::new("."));
    let log_name = log_path.file_name().unwrap_or_default();
    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(log_dir, log_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
}

fn build_writer(config: &Config, staging_dir: &Path) -> AttachmentWriter {
    AttachmentWriter::new(staging_dir, config.decrypt.extension.clone())
}

fn build_pipeline(config: &Config) -> anyhow::Result<Arc<Pipeline>> {
    let passphrase = config
        .decrypt
        .password
        .clone()
        .context("decrypt.password is not set (or MAILSTASH_PDF_PASSWORD)")?;
    let archive = create_archive(&config.archive)?;
    Ok(Arc::new(Pipeline::new(
        Arc::new(QpdfDecryptor::from_config(&config.decrypt)),
        Arc::from(archive),
        passphrase,
        config.archive.remote_prefix.clone(),
    )))
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator<ImapConnector>> {
    config.validate()?;
    let connector = ImapConnector::from_config(&config.imap)?;
    let settings = OrchestratorSettings {
        mailbox: config.imap.mailbox.clone(),
        criteria: SearchCriteria::from_config(&config.filter),
        mark_seen: config.imap.mark_seen,
        connect_timeout: config.imap.connect_timeout(),
    };
    Ok(Orchestrator::new(
        connector,
        settings,
        build_writer(config, &config.staging.dir),
        build_pipeline(config)?,
    ))
}

async fn cmd_run(config: &Config) -> anyhow::Result<()> {
    let mut orchestrator = build_orchestrator(config)?;
    tracing::info!(
        interval_secs = config.schedule.interval_secs,
        sender = %config.filter.sender,
        "Starting poll loop"
    );
    orchestrator
        .run(config.schedule.interval(), shutdown_signal())
        .await;
    Ok(())
}

async fn cmd_poll(config: &Config) -> anyhow::Result<()> {
    let mut orchestrator = build_orchestrator(config)?;
    let report = orchestrator.poll_once().await?;

    println!();
    println!("  {:<25} {}", "Matched messages", report.matched);
    println!("  {:<25} {}", "Attachments", report.dispatched);
    println!("  {:<25} {}", "Completed", report.completed());
    println!("  {:<25} {}", "Failed writes", report.write_failures);
    for pipeline in report.pipelines.iter().filter(|p| !p.is_done()) {
        println!(
            "  {:<25} {} ({})",
            pipeline.file.original_path.display(),
            pipeline.stage,
            pipeline.error.as_deref().unwrap_or("")
        );
    }
    println!();
    Ok(())
}

/// Print the attachments of a local message.
fn cmd_inspect(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let message = eml::read_eml(path)?;
    let located = locate::locate(&message.root, message.date);

    println!();
    println!("  {:<12} {}", "From", message.from.as_deref().unwrap_or("-"));
    println!("  {:<12} {}", "Subject", message.subject.as_deref().unwrap_or("-"));
    println!("  {:<12} {}", "Date", message.date.to_rfc2822());
    println!();
    println!("  {} attachment(s)", located.len());
    if located.is_empty() {
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {:<6} {:<26} {:<11} {:<17} {:>8}  {}",
        "Part", "Type", "Disposition", "Encoding", "Size", "Filename"
    );
    println!("  {}", "-".repeat(90));
    for attachment in &located {
        let part = attachment.part_id();
        let size = message
            .raw_part(&part)
            .map(|raw| humansize::format_size(raw.len(), humansize::BINARY))
            .unwrap_or_default();
        println!(
            "  {:<6} {:<26} {:<11} {:<17} {:>8}  {}",
            part.as_str(),
            attachment.node.mime_type(),
            attachment.node.disposition.as_deref().unwrap_or("-"),
            attachment.transfer_encoding().to_string(),
            size,
            attachment.target_filename
        );
    }
    println!();
    Ok(())
}

/// Write the attachments of a local message, optionally post-processing them.
async fn cmd_extract(
    config: &Config,
    path: &Path,
    output: Option<&Path>,
    process: bool,
) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let message = eml::read_eml(path)?;
    let located = locate::locate(&message.root, message.date);
    if located.is_empty() {
        println!("  No attachments found.");
        return Ok(());
    }

    let writer = build_writer(config, output.unwrap_or(config.staging.dir.as_path()));
    writer.prepare().await?;
    let pipeline = if process {
        Some(build_pipeline(config)?)
    } else {
        None
    };

    let mut written = 0usize;
    for attachment in &located {
        let part = attachment.part_id();
        let raw = message
            .part_stream(&part)
            .with_context(|| format!("part {part} has no body"))?;
        let pending = writer.write(attachment, raw).await?;
        written += 1;
        println!(
            "  {:<30} {:>8}",
            pending.original_path.display(),
            humansize::format_size(pending.size, humansize::BINARY)
        );

        if let Some(pipeline) = &pipeline {
            let report = pipeline.process(pending).await;
            let upload = match &report.upload {
                Some(UploadOutcome::Stored(receipt)) => receipt.stored_path.clone(),
                Some(UploadOutcome::Failed(e)) => format!("upload failed: {e}"),
                None => report.error.clone().unwrap_or_default(),
            };
            println!("  {:<30} {} {}", "", report.stage, upload);
        }
    }

    println!(
        "  Extracted {} attachment(s) to {}",
        written,
        writer.staging_dir().display()
    );
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailstash", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
