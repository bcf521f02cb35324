use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xdcc_cli::config::Config;
use xdcc_cli::output::{self, EventSink, HumanFormatter, JsonlFormatter};
use xdcc_cli::proxy::Dialer;
use xdcc_cli::xdcc::{self, event, TransferOutcome, XdccUrl};

#[derive(Parser)]
#[command(name = "xdcc", version, about = "Download files offered by XDCC bots over IRC")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download one or more XDCC packs.
    Get(GetArgs),
}

#[derive(Args)]
struct GetArgs {
    /// XDCC URLs (irc://network[:port]/channel/bot/slot).
    urls: Vec<String>,

    /// Read additional URLs from a file, one per line ('#' starts a comment).
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output directory. An existing file of the same name is appended to.
    #[arg(short = 'o', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    /// Require verified TLS; never fall back to insecure TLS or plaintext.
    #[arg(long)]
    ssl_only: bool,

    /// SOCKS5 proxy for all connections (socks5://[user:pass@]host:port).
    /// Defaults to XDCC_PROXY, ALL_PROXY or all_proxy.
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Output format: cli or jsonl.
    #[arg(long, default_value = "cli")]
    format: String,

    /// Map remote filenames to filesystem-safe ASCII.
    #[arg(long)]
    sanitize_filenames: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xdcc_cli=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Usage errors exit 1, matching pre-flight failures.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    match cli.command {
        Command::Get(args) => run_get(args).await,
    }
}

async fn run_get(args: GetArgs) -> Result<()> {
    let jsonl = match args.format.as_str() {
        "jsonl" => true,
        "cli" => false,
        other => {
            tracing::warn!("unknown format {:?}, falling back to cli", other);
            false
        }
    };

    let dialer = match Dialer::from_flag_or_env(args.proxy.as_deref()) {
        Ok(dialer) => Arc::new(dialer),
        Err(e) => {
            eprintln!("xdcc: {}", e);
            std::process::exit(1);
        }
    };

    let mut urls = args.urls.clone();
    if let Some(path) = &args.input {
        urls.extend(load_url_list(path)?);
    }
    if urls.is_empty() {
        eprintln!("xdcc: no URLs given");
        std::process::exit(1);
    }

    let sink: Arc<Mutex<Box<dyn EventSink + Send>>> = Arc::new(Mutex::new(if jsonl {
        Box::new(JsonlFormatter::stdout())
    } else {
        Box::new(HumanFormatter::new())
    }));

    // Pre-flight URL validation. In JSONL mode a bad URL becomes a fatal
    // error line and the rest of the batch proceeds; otherwise it kills
    // the run before any transfer starts.
    let mut parsed = Vec::new();
    let mut preflight_failures = 0usize;
    for raw in &urls {
        match XdccUrl::parse(raw) {
            Ok(url) => parsed.push(url),
            Err(e) => {
                if jsonl {
                    sink.lock().unwrap().error(&event::ErrorEvent {
                        url: raw.clone(),
                        error: e.to_string(),
                        error_type: e.error_type().into(),
                        fatal: true,
                    });
                    preflight_failures += 1;
                } else {
                    eprintln!("xdcc: {}: {}", raw, e);
                    std::process::exit(1);
                }
            }
        }
    }

    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("creating {}", args.out_dir.display()))?;

    let config = Arc::new(Config {
        out_dir: args.out_dir.clone(),
        ssl_only: args.ssl_only,
        sanitize_filenames: args.sanitize_filenames,
        ..Config::default()
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, aborting transfers");
                cancel.cancel();
            }
        });
    }

    // One transfer task and one consumer task per URL; the consumers
    // funnel into the shared formatter.
    let mut transfers = Vec::new();
    let mut consumers = Vec::new();
    for url in parsed {
        let (tx, mut rx) = event::channel();
        let sink = sink.clone();
        consumers.push(tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let mut sink = sink.lock().unwrap();
                output::dispatch(sink.as_mut(), &ev);
            }
        }));
        transfers.push(tokio::spawn(xdcc::run_with_fallback(
            url,
            config.clone(),
            dialer.clone(),
            tx,
            cancel.clone(),
        )));
    }

    let outcomes = join_all(transfers).await;
    // Transfer tasks have dropped their senders; consumers drain and stop.
    join_all(consumers).await;

    let successful = outcomes
        .iter()
        .filter(|res| matches!(res, Ok(TransferOutcome::Completed)))
        .count();
    let total = outcomes.len() + preflight_failures;

    sink.lock().unwrap().finished(&event::Finished {
        total_transfers: total,
        successful,
        failed: total - successful,
    });

    Ok(())
}

fn load_url_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading URL list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
