//!
//! blobsync server binary
//! ----------------------
//! Standalone storage server. Settings come from an optional JSON config
//! file, overridden by environment variables, overridden by flags.

use std::env;

use anyhow::{anyhow, bail, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use blobsync::config::{ServerConfig, ENV_DATA_DIR, ENV_HTTP_PORT};

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--config <file>] [--data <dir>] [--port <port>]\n\nFlags:\n  --config <file>   JSON settings file (data_dir, http_port, users)\n  --data <dir>      storage root, default ./data (env {ENV_DATA_DIR})\n  --port <port>     listen port, default 8737 (env {ENV_HTTP_PORT})\n  -h, --help        show this help"
    );
}

fn load_config(argv: &[String]) -> Result<Option<ServerConfig>> {
    let mut cfg = ServerConfig::default();

    // config file first, then env, then flags
    let mut it = argv.iter();
    let mut overrides: Vec<(String, String)> = Vec::new();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--config" | "--data" | "--port" => {
                let val = it
                    .next()
                    .ok_or_else(|| anyhow!("{arg} needs a value"))?
                    .clone();
                if arg == "--config" {
                    cfg = ServerConfig::load(std::path::Path::new(&val))?;
                } else {
                    overrides.push((arg.clone(), val));
                }
            }
            other => bail!("unknown flag '{other}'"),
        }
    }

    if let Ok(val) = env::var(ENV_DATA_DIR) {
        cfg.data_dir = val;
    }
    if let Ok(val) = env::var(ENV_HTTP_PORT) {
        cfg.http_port = val.parse().map_err(|_| anyhow!("invalid {ENV_HTTP_PORT} '{val}'"))?;
    }

    for (flag, val) in overrides {
        match flag.as_str() {
            "--data" => cfg.data_dir = val,
            "--port" => {
                cfg.http_port = val.parse().map_err(|_| anyhow!("invalid port '{val}'"))?;
            }
            _ => unreachable!(),
        }
    }

    Ok(Some(cfg))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let argv: Vec<String> = env::args().collect();
    let program = argv.first().map(String::as_str).unwrap_or("blobsync_server");

    let Some(cfg) = load_config(&argv[1..])? else {
        print_usage(program);
        return Ok(());
    };

    info!(
        target: "server",
        "blobsync starting: port={}, data_dir='{}', users={}",
        cfg.http_port,
        cfg.data_dir,
        cfg.users.len()
    );
    blobsync::server::run(cfg).await
}
