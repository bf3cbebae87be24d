mod commands;

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use nfe_emitter::types::Environment;
use nfe_emitter_client::config::{CertificateConfig, LoggingConfig};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::Targets, prelude::*};

#[derive(Parser)] // Should not derive debug, contains secrets
#[clap(name = "nfe-emitter", about = "Operator tool for NF-e emission")]
pub struct Cli {
    /// Path to the emitter config file
    #[clap(long, env = "NFE_EMITTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base64 encoded PKCS#12 bundle. Overrides the bundle path in the config
    /// file. Its password is read from the variable named in the config.
    #[clap(long, env = "NFE_CERTIFICATE_PKCS12", hide_env_values = true)]
    pub pkcs12: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check whether the authorization service is in operation
    Status {
        #[clap(long)]
        environment: Option<Environment>,
    },
    /// Emit the invoice for a sale exported as JSON
    Emit(commands::EmitArgs),
    /// Emit with the next number reserved from the PostgreSQL counter
    EmitNext(commands::EmitNextArgs),
    /// Resume polling the receipt of an earlier emission
    Poll {
        /// Signed document returned by the emission
        signed_xml: PathBuf,
        receipt: String,
        /// Where to write the `nfeProc` when authorized
        #[clap(long)]
        out: Option<PathBuf>,
    },
    /// Ask the authority what it knows about an access key
    Query {
        access_key: String,
        #[clap(long)]
        environment: Option<Environment>,
    },
    /// Settle an emission whose outcome is unknown
    Reconcile {
        signed_xml: PathBuf,
        #[clap(long)]
        out: Option<PathBuf>,
    },
    /// Build and sign a document without transmitting it
    Preview(commands::PreviewArgs),
    /// Verify the signature of a signed document
    Verify { signed_xml: PathBuf },
    /// Validate an access key and show its fields
    CheckKey { access_key: String },
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = run_main().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

pub async fn run_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that need no configuration run before logging is set up.
    match &cli.command {
        Command::CheckKey { access_key } => return commands::check_key(access_key),
        Command::Verify { signed_xml } => return commands::verify(signed_xml),
        _ => {}
    }

    let config_path = cli
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("--config (or NFE_EMITTER_CONFIG) is required"))?;
    let config = nfe_emitter_client::Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // We keep `_logging` around for the lifetime of the program. On drop, this
    // value will ensure that our logs are flushed.
    let _logging = init_logging(&config.logging)?;
    info!("Logging config settings: {:?}", config.logging);

    let pkcs12_bytes = cli
        .pkcs12
        .as_deref()
        .map(|encoded| STANDARD.decode(encoded.trim()))
        .transpose()
        .context("decoding --pkcs12")?;
    if pkcs12_bytes.is_none() && config.certificate.pkcs12.is_none() {
        return Err(anyhow!(
            "no certificate: set certificate.pkcs12 in the config or pass --pkcs12, \
             with the password in {}",
            CertificateConfig::DEFAULT_PASSWORD_ENV
        ));
    }

    commands::run(cli.command, config, pkcs12_bytes).await
}

/// Object representing our logging. Should be kept around as our logging
/// writers return guards that should live for the lifetime of the program. Do
/// not do anything with the guards. Just make sure they are not dropped!
#[derive(Default)]
struct LoggingGuards {
    _all_layer_guard: Option<WorkerGuard>,
    _emitter_layer_guard: Option<WorkerGuard>,
}

/// Initialize our logging with different logging layers:
/// 1) Log messages at `stdout_log_level` or higher from our nfe_emitter*
/// crates to standard out.
/// 2) (OPTIONAL) Log all messages (TRACE or higher) from our nfe_emitter*
/// crates to the path specified by `emitter_logs_file_name`.
/// 3) (OPTIONAL) Log all messages (TRACE or higher) from any crate to the
/// path specified by `all_logs_file_name`.
///
/// Returns an object which should be kept around for the lifetime of the
/// program.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuards> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr)
        .with_filter(our_targets_filter(config.stdout_log_level));

    let logging_guards = match &config.log_files {
        Some(file_config) => {
            let (all_logs_dir, all_logs_file) = get_paths(&file_config.all_logs_file_name)?;
            let (emitter_logs_dir, emitter_logs_file) =
                get_paths(&file_config.emitter_logs_file_name)?;

            let all_appender = tracing_appender::rolling::hourly(all_logs_dir, all_logs_file);
            let (non_blocking, _all_layer_guard) = tracing_appender::non_blocking(all_appender);
            let all_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking);

            let emitter_appender =
                tracing_appender::rolling::hourly(emitter_logs_dir, emitter_logs_file);
            let (non_blocking, _emitter_layer_guard) =
                tracing_appender::non_blocking(emitter_appender);
            let emitter_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(our_targets_filter(Level::TRACE));

            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(emitter_layer)
                .with(all_layer)
                .init();

            LoggingGuards {
                _all_layer_guard: Some(_all_layer_guard),
                _emitter_layer_guard: Some(_emitter_layer_guard),
            }
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            LoggingGuards::default()
        }
    };

    Ok(logging_guards)
}

/// Return the path directory and the file name. Needed for passing to
/// tracing_appender.
fn get_paths(path: &Path) -> anyhow::Result<(&Path, &OsStr)> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("invalid log file path {}", path.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("invalid log file path {}", path.display()))?;
    Ok((dir, file_name))
}

fn our_targets_filter(level: Level) -> Targets {
    Targets::new()
        .with_target("nfe_emitter_cli", level)
        .with_target("nfe_emitter_client", level)
        .with_target("nfe_emitter", level)
        .with_target("nfe_emitter_postgres", level)
}
