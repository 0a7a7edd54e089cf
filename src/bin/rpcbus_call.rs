//! rpcbus-call: One-shot OCR RPC client
//!
//! Reads a document, sends it to the OCR worker through the RPC client, and
//! prints the JSON reply. Failures are reported with the HTTP status a
//! gateway would return for them.
//!
//! ## Example
//! ```text
//! rpcbus-call scan.png --user-email ann@example.com --timeout 30
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use tracing::error;

use rpcbus::broker::{AmqpConnection, RequestReply};
use rpcbus::config::Config;
use rpcbus::ocr::{OcrRequest, OcrResponse};
use rpcbus::rpc::{RpcClient, RpcClientConfig};
use rpcbus::utils::bootstrap::init_tracing;

#[derive(Parser)]
#[command(name = "rpcbus-call")]
#[command(about = "Send a document to the OCR worker and print the reply")]
#[command(version)]
struct Cli {
    /// Document to recognize
    file: PathBuf,

    /// YAML config file
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = "")]
    user_name: String,

    #[arg(long, default_value = "")]
    user_email: String,

    #[arg(long, default_value = "")]
    user_id: String,

    /// Seconds to wait for the reply (default: rpc.timeout_secs)
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "rpcbus-call failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(cli.config.as_deref())?;
    let document = tokio::fs::read(&cli.file).await?;
    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.rpc.timeout());

    let request = OcrRequest {
        user_name: cli.user_name,
        user_email: cli.user_email,
        user_id: cli.user_id,
        file: STANDARD.encode(&document),
    };

    let connection = AmqpConnection::connect(&config.amqp).await;
    let channel = connection.open("rpc-client").await?;
    let client = RpcClient::start(
        RequestReply::new(Arc::new(channel)),
        RpcClientConfig::from(&config.rpc),
    )
    .await?;

    let result = client
        .call_with_timeout::<_, OcrResponse>(&request, timeout)
        .await;
    drop(client);
    let _ = connection.close().await;

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => Err(format!("{} ({})", e, e.http_status()).into()),
    }
}
