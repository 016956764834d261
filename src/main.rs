//! Taler Merchant Backend CLI
//!
//! Runs a batch of merchant backend operations read from a JSON-lines file.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- --config merchant.toml requests.jsonl > replies.jsonl
//! cargo run -- --config merchant.toml --log-level debug --timeout 10 requests.jsonl
//! ```
//!
//! Each input line is one operation such as
//! `{"op":"order_status","instance":"default","order_id":"2024.123-ABC"}`.
//! Each output line is the matching reply `{"status":200,"body":{...}}`.
//! Logs go to stderr; `RUST_LOG` overrides `--log-level`.
//!
//! # Exit Codes
//!
//! - 0: Every line was processed (individual operations may still have failed)
//! - 1: Fatal error (bad configuration, unreadable input, broken output)

use std::error::Error;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use taler_merchant_backend::cli::{self, CliArgs};
use taler_merchant_backend::exchange::HttpTransport;
use taler_merchant_backend::io::{ReplyWriter, RequestReader};
use taler_merchant_backend::{dispatch, MerchantBackend, MerchantConfig, Reply};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = cli::parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        error!(error = %e, "Fatal error");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &CliArgs) -> Result<(), Box<dyn Error>> {
    let mut config = MerchantConfig::load(&args.config)?;
    if let Some(timeout) = args.timeout {
        config.exchange_timeout = timeout;
    }
    let reader = RequestReader::open(&args.requests)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(config.exchange_timeout))?);
        let backend = MerchantBackend::from_config(&config, transport);
        let _downloads = backend.start();

        let mut writer = ReplyWriter::new(std::io::stdout().lock());
        let mut failed = 0usize;
        for item in reader {
            let reply = match item {
                Ok(request) => dispatch(&backend, request).await,
                Err(e) if e.is_fatal() => {
                    backend.shutdown();
                    return Err(e.into());
                }
                Err(e) => Reply::error(&e.to_merchant_error()),
            };
            if !reply.is_success() {
                failed += 1;
            }
            writer.write(&reply)?;
        }

        backend.shutdown();
        info!(replies = writer.written(), failed, "All requests processed");
        Ok::<(), Box<dyn Error>>(())
    })
}
