use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::Args;
use nfe_emitter::{
    access_key::AccessKey,
    document::{BuildRequest, DocumentBuilder},
    signature::{verify_signed_xml, SignatureEngine},
    types::{
        Environment, InMemorySaleSource, InvoiceSeries, ReceiptNumber, SaleRecord,
        TransmissionOutcome,
    },
};
use nfe_emitter_client::{
    Config, Emission, EmissionRequest, NextEmissionRequest, NfeEmitterClient,
};
use nfe_emitter_postgres::{ConfigFile as DatabaseConfigFile, PostgresInvoiceCounter};
use rand::rngs::OsRng;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Command;

#[derive(Debug, Args)]
pub struct EmitArgs {
    /// Sale record as exported by the checkout, in JSON
    pub sale: PathBuf,
    #[clap(long)]
    pub series: u32,
    #[clap(long)]
    pub number: u64,
    #[clap(flatten)]
    pub common: EmissionArgs,
}

#[derive(Debug, Args)]
pub struct EmitNextArgs {
    pub sale: PathBuf,
    /// Database config file for the invoice counter
    #[clap(long)]
    pub database_config: PathBuf,
    #[clap(flatten)]
    pub common: EmissionArgs,
}

#[derive(Debug, Args)]
pub struct EmissionArgs {
    #[clap(long)]
    pub environment: Option<Environment>,
    /// Give up waiting for the authority after this many seconds
    #[clap(long)]
    pub timeout_secs: Option<u64>,
    /// Directory for the signed document and, when authorized, the `nfeProc`
    #[clap(long, default_value = ".")]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    pub sale: PathBuf,
    #[clap(long)]
    pub series: u32,
    #[clap(long)]
    pub number: u64,
    #[clap(long)]
    pub environment: Option<Environment>,
    /// Write the signed document here instead of standard output
    #[clap(long)]
    pub out: Option<PathBuf>,
}

pub async fn run(
    command: Command,
    config: Config,
    pkcs12_bytes: Option<Vec<u8>>,
) -> anyhow::Result<()> {
    let identities = config.identity_source(pkcs12_bytes)?;

    if let Command::Preview(args) = &command {
        return preview(args, &config, identities.load()?);
    }

    let sales = match &command {
        Command::Emit(EmitArgs { sale, .. }) | Command::EmitNext(EmitNextArgs { sale, .. }) => {
            InMemorySaleSource::new([read_sale(sale)?])
        }
        _ => InMemorySaleSource::default(),
    };
    let client = NfeEmitterClient::new(config, identities, Arc::new(sales));
    let cancel = cancel_on_ctrl_c();

    match command {
        Command::Status { environment } => {
            let status = client.service_status(environment).await?.data;
            println!("{status:#?}");
        }
        Command::Emit(args) => {
            let sale = read_sale(&args.sale)?;
            let request = EmissionRequest {
                sale: sale.reference,
                series: InvoiceSeries::new(args.series, args.number)?,
                environment: args.common.environment,
                deadline: deadline(args.common.timeout_secs),
            };
            let emission = client.emit_invoice(request, cancel).await?.data;
            report_emission(&emission, &args.common.out)?;
        }
        Command::EmitNext(args) => {
            let sale = read_sale(&args.sale)?;
            let database_config = DatabaseConfigFile::from_file(&args.database_config)?;
            let counter = PostgresInvoiceCounter::connect(database_config.try_into()?).await?;
            let request = NextEmissionRequest {
                sale: sale.reference,
                environment: args.common.environment,
                deadline: deadline(args.common.timeout_secs),
            };
            let emission = client
                .emit_next_invoice(request, &counter, cancel)
                .await?
                .data;
            report_emission(&emission, &args.common.out)?;
        }
        Command::Poll {
            signed_xml,
            receipt,
            out,
        } => {
            let xml = read_to_string(&signed_xml)?;
            let outcome = client
                .poll_receipt(&xml, ReceiptNumber::new(receipt), cancel)
                .await?
                .data;
            report_outcome(&outcome, out.as_deref())?;
        }
        Command::Query {
            access_key,
            environment,
        } => {
            let access_key: AccessKey = access_key.parse()?;
            let status = client.query_protocol(&access_key, environment).await?.data;
            println!("{status:#?}");
        }
        Command::Reconcile { signed_xml, out } => {
            let xml = read_to_string(&signed_xml)?;
            let outcome = client.reconcile(&xml).await?.data;
            report_outcome(&outcome, out.as_deref())?;
        }
        Command::Preview(_) | Command::Verify { .. } | Command::CheckKey { .. } => {
            unreachable!("handled before the client is built")
        }
    }
    Ok(())
}

pub fn check_key(access_key: &str) -> anyhow::Result<()> {
    let key: AccessKey = access_key.trim().parse()?;
    println!("access key   {key}");
    println!("cUF          {}", key.uf_code());
    println!("CNPJ         {}", key.issuer_cnpj());
    println!("series       {}", key.series());
    println!("number       {}", key.number());
    println!("cNF          {}", key.nonce());
    println!("cDV          {}", key.check_digit());
    Ok(())
}

pub fn verify(signed_xml: &Path) -> anyhow::Result<()> {
    let xml = read_to_string(signed_xml)?;
    let verified = verify_signed_xml(&xml, None)?;
    println!(
        "{}: signature valid ({}, digest {})",
        verified.access_key, verified.algorithm, verified.digest_value
    );
    Ok(())
}

fn preview(
    args: &PreviewArgs,
    config: &Config,
    identity: nfe_emitter::crypto::SigningIdentity,
) -> anyhow::Result<()> {
    let sale = read_sale(&args.sale)?;
    let environment = args.environment.unwrap_or(config.environment);
    let builder = DocumentBuilder::new(&config.issuer, &config.products, &config.tax);
    let unsigned = builder.build(
        &BuildRequest {
            sale: &sale,
            series: InvoiceSeries::new(args.series, args.number)?,
            environment,
            issued_at: OffsetDateTime::now_utc(),
        },
        &mut OsRng,
    )?;
    let signed = SignatureEngine::new(config.signature_algorithm).sign(&unsigned, &identity)?;
    info!(access_key = %signed.access_key(), total = %signed.total(), "Document signed");

    match &args.out {
        Some(path) => write(path, signed.xml())?,
        None => println!("{}", signed.xml()),
    }
    Ok(())
}

fn report_emission(emission: &Emission, out_dir: &Path) -> anyhow::Result<()> {
    let signed_path = out_dir.join(format!("{}-nfe.xml", emission.access_key));
    write(&signed_path, &emission.signed_xml)?;
    println!("access key  {}", emission.access_key);
    println!("series      {}", emission.series);
    println!("signed      {}", signed_path.display());

    let proc_path = out_dir.join(format!("{}-procNFe.xml", emission.access_key));
    report_outcome(&emission.outcome, Some(&proc_path))
}

fn report_outcome(outcome: &TransmissionOutcome, proc_path: Option<&Path>) -> anyhow::Result<()> {
    println!("outcome     {outcome}");
    match outcome {
        TransmissionOutcome::Authorized(document) => {
            if let Some(path) = proc_path {
                write(path, &document.nfe_proc)?;
                println!("nfeProc     {}", path.display());
            }
        }
        _ if outcome.requires_reconciliation() => {
            warn!("Outcome unknown; run `reconcile` before submitting this sale again");
        }
        _ => {}
    }
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn deadline(timeout_secs: Option<u64>) -> Option<Instant> {
    timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    let _handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next wait");
            cancel.cancel();
        }
    });
    token
}

fn read_sale(path: &Path) -> anyhow::Result<SaleRecord> {
    let json = read_to_string(path)?;
    serde_json::from_str(&json).with_context(|| format!("decoding sale {}", path.display()))
}

fn read_to_string(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        return Err(anyhow!("refusing to overwrite {}", path.display()));
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}
