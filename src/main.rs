//!
//! blobsync CLI binary
//! -------------------
//! Push and pull directory trees against a blobsync server, and manage the
//! named remotes those commands refer to. Remote targets are written
//! `<remote>:<path>`, where `<remote>` is a name registered with
//! `blobsync remote add`.

use std::env;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use blobsync::client::RestClient;
use blobsync::config::{parse_remote_url, RemoteConfig, RemotesConfig};
use blobsync::sync::{reconcile, LocalTree, SyncOptions, SyncReport};
use blobsync::types::ConflictPolicy;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} push <source-dir> <remote>:<path> [--conflict <policy>] [--prune] [--dry]\n  {program} pull <remote>:<path> <dest-dir> [--conflict <policy>] [--prune] [--dry]\n  {program} remote add <name> <url> [--user <u>] [--password <p>]\n  {program} remote remove <name>\n  {program} remote list\n  {program} remote status <name>\n\nFlags:\n  --conflict <policy>   skip (default), overwrite, or copy (numbered versions)\n  --prune               delete destination files absent from the source\n  --dry                 log the planned actions without transferring anything\n  --user <u>            basic-auth username for `remote add`\n  --password <p>        basic-auth password for `remote add`\n  -h, --help            show this help\n\nExamples:\n  {program} remote add origin https://files.example.test:8737\n  {program} push ./docs origin:/docs --conflict overwrite --prune\n  {program} pull origin:/docs ./docs-copy --dry"
    );
}

struct SyncArgs {
    policy: ConflictPolicy,
    prune: bool,
    dry_run: bool,
    positional: Vec<String>,
}

fn parse_sync_args(args: &[String]) -> Result<SyncArgs> {
    let mut out = SyncArgs {
        policy: ConflictPolicy::default(),
        prune: false,
        dry_run: false,
        positional: Vec::new(),
    };
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--conflict" => {
                let val = it.next().ok_or_else(|| anyhow!("--conflict needs a value"))?;
                out.policy = val.parse().map_err(|e| anyhow!("{e}"))?;
            }
            other if other.starts_with("--conflict=") => {
                let val = &other["--conflict=".len()..];
                out.policy = val.parse().map_err(|e| anyhow!("{e}"))?;
            }
            "--prune" => out.prune = true,
            "--dry" | "--dry-run" => out.dry_run = true,
            other if other.starts_with('-') => bail!("unknown flag '{other}'"),
            other => out.positional.push(other.to_string()),
        }
    }
    Ok(out)
}

/// Split `<remote>:<path>` into the registered remote and its path prefix.
fn parse_target(target: &str) -> Result<(String, String)> {
    let (name, path) = target
        .split_once(':')
        .ok_or_else(|| anyhow!("remote target '{target}' must be <remote>:<path>"))?;
    if name.is_empty() {
        bail!("remote target '{target}' has an empty remote name");
    }
    let path = if path.is_empty() { "/" } else { path };
    Ok((name.to_string(), path.to_string()))
}

async fn connect(name: &str) -> Result<RestClient> {
    let registry = RemotesConfig::load(&RemotesConfig::default_path()?)?;
    let remote = registry.get(name)?;
    let client = RestClient::new(remote)?;
    client
        .ping()
        .await
        .with_context(|| format!("remote '{name}' at {}", client.remote_url()))?;
    Ok(client)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "cli", "interrupt received, stopping");
            handle.cancel();
        }
    });
    token
}

fn print_report(report: &SyncReport, dry_run: bool) {
    for action in &report.actions {
        println!("{action}");
    }
    let prefix = if dry_run { "would transfer" } else { "transferred" };
    println!(
        "{prefix} {} file(s), pruned {}",
        report.transferred(),
        report.pruned()
    );
}

async fn run_push(args: &[String]) -> Result<()> {
    let parsed = parse_sync_args(args)?;
    let [source, target] = parsed.positional.as_slice() else {
        bail!("push needs <source-dir> and <remote>:<path>");
    };
    let (remote_name, remote_path) = parse_target(target)?;
    if !std::path::Path::new(source).is_dir() {
        bail!("source '{source}' is not a directory");
    }

    let client = connect(&remote_name).await?;
    let local = LocalTree::new(source.as_str());
    let opts = SyncOptions {
        policy: parsed.policy,
        prune: parsed.prune,
        dry_run: parsed.dry_run,
    };

    info!(target: "cli", source = %source, remote = %remote_name, path = %remote_path, "push");
    let report = reconcile(&local, &client, "/", &remote_path, &opts, &cancel_on_ctrl_c()).await?;
    print_report(&report, parsed.dry_run);
    Ok(())
}

async fn run_pull(args: &[String]) -> Result<()> {
    let parsed = parse_sync_args(args)?;
    let [target, dest] = parsed.positional.as_slice() else {
        bail!("pull needs <remote>:<path> and <dest-dir>");
    };
    let (remote_name, remote_path) = parse_target(target)?;
    std::fs::create_dir_all(dest).with_context(|| format!("create '{dest}'"))?;

    let client = connect(&remote_name).await?;
    let local = LocalTree::new(dest.as_str());
    let opts = SyncOptions {
        policy: parsed.policy,
        prune: parsed.prune,
        dry_run: parsed.dry_run,
    };

    info!(target: "cli", remote = %remote_name, path = %remote_path, dest = %dest, "pull");
    let report = reconcile(&client, &local, &remote_path, "/", &opts, &cancel_on_ctrl_c()).await?;
    print_report(&report, parsed.dry_run);
    Ok(())
}

async fn run_remote(args: &[String]) -> Result<()> {
    let path = RemotesConfig::default_path()?;
    let mut registry = RemotesConfig::load(&path)?;

    match args.first().map(String::as_str) {
        Some("add") => {
            let (name, url) = match args.get(1).zip(args.get(2)) {
                Some(pair) => pair,
                None => bail!("remote add needs <name> and <url>"),
            };
            let mut remote: RemoteConfig = parse_remote_url(url)?;
            let mut it = args[3..].iter();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--user" => {
                        remote.username =
                            Some(it.next().ok_or_else(|| anyhow!("--user needs a value"))?.clone());
                    }
                    "--password" => {
                        remote.password = Some(
                            it.next()
                                .ok_or_else(|| anyhow!("--password needs a value"))?
                                .clone(),
                        );
                    }
                    other => bail!("unknown flag '{other}'"),
                }
            }
            registry.remotes.insert(name.clone(), remote);
            registry.save(&path)?;
            println!("remote '{name}' saved");
        }
        Some("remove") => {
            let name = args.get(1).ok_or_else(|| anyhow!("remote remove needs <name>"))?;
            if registry.remotes.remove(name).is_none() {
                bail!("remote '{name}' is not registered");
            }
            registry.save(&path)?;
            println!("remote '{name}' removed");
        }
        Some("list") => {
            if registry.remotes.is_empty() {
                println!("no remotes registered");
            }
            for (name, remote) in &registry.remotes {
                let auth = remote.username.as_deref().unwrap_or("-");
                println!("{name}\t{}\t{auth}", remote.url);
            }
        }
        Some("status") => {
            let name = args.get(1).ok_or_else(|| anyhow!("remote status needs <name>"))?;
            match connect(name).await {
                Ok(client) => println!("{name}: ok ({})", client.remote_url()),
                Err(e) => println!("{name}: unreachable ({e:#})"),
            }
        }
        _ => bail!("remote needs one of: add, remove, list, status"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let argv: Vec<String> = env::args().collect();
    let program = argv.first().map(String::as_str).unwrap_or("blobsync");

    match argv.get(1).map(String::as_str) {
        Some("push") => run_push(&argv[2..]).await,
        Some("pull") => run_pull(&argv[2..]).await,
        Some("remote") => run_remote(&argv[2..]).await,
        Some("-h") | Some("--help") | None => {
            print_usage(program);
            Ok(())
        }
        Some(other) => {
            print_usage(program);
            Err(anyhow!("unknown command '{other}'"))
        }
    }
}
