//! Zentinel SOAP engine driver.
//!
//! Run with: `zentinel-soap-engine --config engine.yaml --input request.xml`
//!
//! Runs one SOAP message through the configured handler chain and writes the
//! resulting envelope to stdout. When the chain faults, a SOAP fault envelope
//! is written instead and the process exits with an error.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_engine::dispatch::{DispatchError, Dispatcher};
use zentinel_soap_engine::soap::{fault_envelope, reply_version};
use zentinel_soap_engine::{
    Document, EngineConfig, HandlerChain, HandlerRegistry, MessageContext, SerializeMode,
    SourceOptions,
};

/// Run a SOAP message through a handler chain.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "engine.yaml")]
    config: PathBuf,

    /// Message to process; stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// SOAPAction header value of the message
    #[arg(long)]
    soap_action: Option<String>,

    /// Output mode (cached, stream); overrides the configured mode
    #[arg(short, long)]
    mode: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the envelope
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel SOAP engine v{}", env!("CARGO_PKG_VERSION"));

    let config = if args.config.exists() {
        EngineConfig::load(&args.config).context("Failed to load config file")?
    } else {
        info!(config = %args.config.display(), "Config file not found, using defaults");
        EngineConfig::default()
    };
    let mode = match args.mode.as_deref() {
        Some(label) => SerializeMode::parse(label)
            .with_context(|| format!("Unknown output mode '{}'", label))?,
        None => config.settings.serialize_mode,
    };

    let registry = HandlerRegistry::with_builtins();
    let chain = HandlerChain::from_config(&config, &registry).context("Failed to build handler chain")?;
    info!(handlers = ?chain.handler_names(), mode = mode.as_str(), "Engine ready");

    let input = read_input(args.input.as_ref(), config.settings.max_message_size)?;
    let options = SourceOptions {
        reject_doctype: config.settings.reject_doctype,
        trim_text: config.settings.trim_whitespace,
    };
    let mut ctx = MessageContext::new(Document::parse_bytes(input, options))
        .with_message_id(format!("cli-{}", std::process::id()));
    if let Some(action) = args.soap_action {
        ctx = ctx.with_soap_action(action);
    }

    let dispatcher = Dispatcher::new(Arc::new(chain), tokio::runtime::Handle::current());
    let outcome = dispatcher
        .invoke_async(ctx)
        .map_err(|e| anyhow!("Failed to dispatch message: {}", e))?
        .await;
    dispatcher.shutdown();
    dispatcher.drain().await;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match outcome {
        Ok(ctx) => {
            let mut envelope = ctx.into_envelope();
            let root = envelope.root();
            envelope
                .serialize_to(root, &mut out, mode)
                .context("Failed to write envelope")?;
            out.write_all(b"\n")?;
            info!(metrics = ?dispatcher.metrics(), "Message processed");
            Ok(())
        }
        Err(DispatchError::Fault { fault, mut context }) => {
            // Rollback clears handler properties, so ask the envelope itself
            let version = reply_version(context.envelope_mut(), config.settings.default_soap_version);
            warn!(handler = %fault.handler, reason = %fault.fault, "Message faulted");

            let mut fault_doc = fault_envelope(version, &fault.fault).context("Failed to build fault")?;
            let root = fault_doc.root();
            fault_doc
                .serialize_to(root, &mut out, SerializeMode::Cached)
                .context("Failed to write fault envelope")?;
            out.write_all(b"\n")?;
            bail!("handler '{}' faulted: {}", fault.handler, fault.fault)
        }
        Err(err) => bail!("Dispatch failed: {}", err),
    }
}

fn read_input(path: Option<&PathBuf>, limit: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    // One byte past the limit tells an oversized message apart from an exact fit
    let take = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    match path {
        Some(path) => std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .take(take)
            .read_to_end(&mut data)?,
        None => std::io::stdin().lock().take(take).read_to_end(&mut data)?,
    };
    if data.len() > limit {
        bail!("Message exceeds maximum size of {} bytes", limit);
    }
    Ok(data)
}
