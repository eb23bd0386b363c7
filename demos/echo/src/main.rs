//! LSP echo server and client.
//!
//! ```text
//! lsp-echo server [--port 9999] [--window N] [--epoch-ms N] [--epoch-limit N]
//! lsp-echo client [--host 127.0.0.1] [--port 9999] [--window N] ...
//! ```
//!
//! The server echoes every message back to the connection it came from. The
//! client sends each line of stdin and prints the echo.

use std::env;
use std::process::ExitCode;

use lsp_protocol::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const DEFAULT_PORT: u16 = 9999;

#[derive(Debug)]
struct Options {
    mode: String,
    host: String,
    port: u16,
    params: Params,
}

fn print_usage() {
    eprintln!("Usage: lsp-echo <server|client> [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --host HOST         Server host (client only, default 127.0.0.1)");
    eprintln!("  --port PORT         Server port (default {DEFAULT_PORT})");
    eprintln!("  --window N          Sliding window size");
    eprintln!("  --epoch-ms N        Epoch length in milliseconds");
    eprintln!("  --epoch-limit N     Silent epochs before a peer is lost");
    eprintln!("  -h, --help          Show this help");
}

fn parse_args() -> Result<Options, String> {
    let mut args = env::args().skip(1);
    let mode = args.next().ok_or("missing mode")?;
    if mode != "server" && mode != "client" {
        return Err(format!("unknown mode: {mode}"));
    }

    let mut host = "127.0.0.1".to_string();
    let mut port = DEFAULT_PORT;
    let mut builder = Params::builder();

    while let Some(flag) = args.next() {
        let mut value = || args.next().ok_or(format!("{flag} needs a value"));
        match flag.as_str() {
            "--host" => host = value()?,
            "--port" => port = value()?.parse().map_err(|e| format!("--port: {e}"))?,
            "--window" => {
                builder = builder.window_size(value()?.parse().map_err(|e| format!("--window: {e}"))?)
            }
            "--epoch-ms" => {
                builder = builder.epoch_millis(value()?.parse().map_err(|e| format!("--epoch-ms: {e}"))?)
            }
            "--epoch-limit" => {
                builder =
                    builder.epoch_limit(value()?.parse().map_err(|e| format!("--epoch-limit: {e}"))?)
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }

    let params = builder.build().map_err(|e| e.to_string())?;
    Ok(Options {
        mode,
        host,
        port,
        params,
    })
}

async fn run_server(opts: Options) -> LspResult<()> {
    let server = LspServer::bind(("0.0.0.0", opts.port), opts.params).await?;
    info!(addr = %server.local_addr(), "echo server ready");

    while let Some((conn_id, payload)) = server.read().await {
        info!(%conn_id, len = payload.len(), "echo");
        if let Err(e) = server.write(conn_id, payload) {
            info!(%conn_id, error = %e, "client gone");
        }
    }
    Ok(())
}

async fn run_client(opts: Options) -> LspResult<()> {
    let client = LspClient::connect((opts.host.as_str(), opts.port), opts.params).await?;
    info!(conn_id = %client.conn_id(), "connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        client.write(line.into_bytes())?;
        match client.read().await {
            Some(echo) => println!("{}", String::from_utf8_lossy(&echo)),
            None => {
                error!("server connection lost");
                break;
            }
        }
    }

    client.close().await
}

#[tokio::main]
async fn main() -> ExitCode {
    if env::args().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {e}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let result = if opts.mode == "server" {
        run_server(opts).await
    } else {
        run_client(opts).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "echo failed");
            ExitCode::FAILURE
        }
    }
}
