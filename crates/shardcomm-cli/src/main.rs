//! # Shardcomm CLI Entry Point
//!
//! Operator tool for poking at cluster peers through the same dispatcher
//! the coordinator uses. Useful for verifying that an endpoint is
//! reachable and answering before wiring it into the topology.
//!
//! ## Usage
//!
//! ```bash
//! # One-shot GET against a peer endpoint
//! shardcomm call tcp://127.0.0.1:8529 /_api/version
//!
//! # POST with a body and a bearer token (outputs raw JSON)
//! shardcomm call ssl://db1.example.com:8530 /_api/document \
//!     -X POST -d '{"k":1}' --auth "bearer token" | jq .code
//! ```
//!
//! ## Destination Format
//!
//! Destinations use the cluster endpoint grammar: `tcp://host:port` for
//! plaintext, `ssl://host:port` for TLS.

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use hyper::Method;
use serde_json::json;
use shardcomm_common::{StaticIdentity, StaticTopology, Status};
use shardcomm_coordinator::{ShardComm, ShardCommConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// shardcomm - cluster dispatcher operator tool
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
}

/// Arguments for a one-shot request.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// perform a single request against a peer endpoint
struct CallArgs {
    /// destination endpoint (tcp://host:port or ssl://host:port)
    #[argh(positional)]
    destination: String,

    /// request path, e.g. /_api/version
    #[argh(positional)]
    path: String,

    /// HTTP method
    #[argh(option, short = 'X', default = "\"GET\".into()")]
    method: String,

    /// request body
    #[argh(option, short = 'd')]
    data: Option<String>,

    /// value for the Authorization header
    #[argh(option, long = "auth", default = "String::new()")]
    auth: String,

    /// request timeout in seconds
    #[argh(option, short = 't', default = "30")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Call(args) => handle_call(args).await,
    }
}

async fn handle_call(args: CallArgs) -> Result<()> {
    // Output stays clean JSON for unix tool usage, so logs go to stderr
    // and only when asked for.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if !args.destination.starts_with("tcp://") && !args.destination.starts_with("ssl://") {
        bail!(
            "invalid destination '{}': must start with tcp:// or ssl://",
            args.destination
        );
    }
    let method: Method = args
        .method
        .parse()
        .with_context(|| format!("invalid method '{}'", args.method))?;

    let comm = ShardComm::new(
        ShardCommConfig::default(),
        Arc::new(StaticTopology::new()),
        Arc::new(StaticIdentity::new("shardcomm-cli", &args.auth)),
    );

    let result = comm
        .sync_request(
            "",
            0,
            &args.destination,
            method,
            &args.path,
            args.data.map(|data| data.into()),
            &HashMap::new(),
            Duration::from_secs(args.timeout),
        )
        .await;
    comm.shutdown().await;

    let output = json!({
        "status": result.status.as_str(),
        "code": result.answer_code,
        "endpoint": result.endpoint,
        "error": if result.error_message.is_empty() {
            serde_json::Value::Null
        } else {
            json!(result.error_message)
        },
        "body": result.result.as_ref().map(|http| http.body_text()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if result.status != Status::Received {
        bail!("{}", result.stringify_error_message());
    }
    Ok(())
}
