use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Limiters, Outcome, RateLimitResult, RequestContext};

/// Replay a traffic log through a configured limiter.
///
/// Reads `<key> [success|failure]` lines from stdin and writes one JSON
/// decision per line to stdout.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file; built-in presets are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the limiter to replay through
    #[arg(short, long, default_value = "api")]
    limiter: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Serialize)]
struct Decision<'a> {
    key: &'a str,
    #[serde(flatten)]
    result: RateLimitResult,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    info!(limiters = config.limiters.len(), "Configuration loaded");

    let limiters = Limiters::from_config(&config, Arc::new(SystemClock)).await?;
    let limiter = limiters.get(&args.limiter).ok_or_else(|| {
        anyhow!(
            "unknown limiter '{}' (configured: {})",
            args.limiter,
            limiters.names().collect::<Vec<_>>().join(", ")
        )
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let (mut admitted, mut denied) = (0u64, 0u64);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let Some((key, outcome)) = parse_line(&line) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Skipping unparseable line");
            }
            continue;
        };

        let ctx = RequestContext::new()
            .with_header("x-forwarded-for", key)
            .with_account(key);
        let result = limiter.check_limit(&ctx, outcome).await;
        if result.allowed {
            admitted += 1;
        } else {
            denied += 1;
        }

        let mut out = serde_json::to_vec(&Decision { key, result })?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
    }
    stdout.flush().await?;

    info!(admitted, denied, "Replay finished");

    drop(limiter);
    limiters.shutdown().await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parse `<key> [success|failure]`.
fn parse_line(line: &str) -> Option<(&str, Outcome)> {
    let mut parts = line.split_whitespace();
    let key = parts.next()?;
    let outcome = match parts.next() {
        None => Outcome::Unknown,
        Some("success" | "ok") => Outcome::Success,
        Some("failure" | "fail") => Outcome::Failure,
        Some(_) => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((key, outcome))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("10.0.0.1"), Some(("10.0.0.1", Outcome::Unknown)));
        assert_eq!(parse_line("  u-1 failure "), Some(("u-1", Outcome::Failure)));
        assert_eq!(parse_line("u-1 ok"), Some(("u-1", Outcome::Success)));
        assert_eq!(parse_line("u-1 maybe"), None);
        assert_eq!(parse_line("u-1 ok extra"), None);
        assert_eq!(parse_line("   "), None);
    }
}
