use std::path::PathBuf;

use docdropd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Status,
    Mkdir { name: String, parent: Option<Uuid> },
    Upload { path: PathBuf, parent: Option<Uuid> },
    Rename { id: Uuid, name: String },
    Remove { id: Uuid },
    Tree { parent: Option<Uuid> },
    Help,
}

const USAGE: &str = "Usage: docdropd [--once | --help | COMMAND]
  (no arguments)            Run the sync daemon until interrupted
  --once                    Drain the command log once and exit
  status                    Show pending commands and the last sync run
  mkdir NAME [--parent ID]  Create a folder
  upload PATH [--parent ID] Queue a PDF for upload
  rename ID NAME            Rename a folder or document
  rm ID                     Remove a document or empty folder
  tree [ID]                 List the cached device tree";

fn parse_id(value: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| anyhow::anyhow!("invalid id: {value}"))
}

fn parse_parent(rest: &[String]) -> anyhow::Result<Option<Uuid>> {
    match rest {
        [] => Ok(None),
        [flag, id] if flag == "--parent" => parse_id(id).map(Some),
        _ => anyhow::bail!("expected --parent ID, got: {}", rest.join(" ")),
    }
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    let Some((first, rest)) = args.split_first() else {
        return Ok(CliMode::Run);
    };
    let mode = match (first.as_str(), rest) {
        ("--once", []) => CliMode::Once,
        ("--help" | "-h", []) => CliMode::Help,
        ("status", []) => CliMode::Status,
        ("mkdir", [name, rest @ ..]) => CliMode::Mkdir {
            name: name.clone(),
            parent: parse_parent(rest)?,
        },
        ("upload", [path, rest @ ..]) => CliMode::Upload {
            path: PathBuf::from(path),
            parent: parse_parent(rest)?,
        },
        ("rename", [id, name]) => CliMode::Rename {
            id: parse_id(id)?,
            name: name.clone(),
        },
        ("rm", [id]) => CliMode::Remove { id: parse_id(id)? },
        ("tree", []) => CliMode::Tree { parent: None },
        ("tree", [id]) => CliMode::Tree {
            parent: Some(parse_id(id)?),
        },
        _ => anyhow::bail!("unknown arguments: {}", args.join(" ")),
    };
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docdropd=info,docdrop_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => return daemon.run().await,
        CliMode::Once => {
            let report = daemon.sync_once().await?;
            println!("processed {} command(s)", report.processed);
            if let Some(abort) = report.aborted {
                println!("stopped early: {abort}");
            }
        }
        CliMode::Status => {
            let pending = daemon.log().count_unsynced().await?;
            println!("pending commands: {pending}");
            if let Some(status) = daemon.log().sync_status().await? {
                println!(
                    "last run: at={} processed={} result={} error={}",
                    status.last_run_at,
                    status.processed,
                    status.last_result.map_or("-", |result| result.as_str()),
                    status.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
        CliMode::Mkdir { name, parent } => {
            let (info, command) = daemon.files().create_folder(&name, parent).await?;
            println!("{} (command #{})", info.id, command.command_number);
        }
        CliMode::Upload { path, parent } => {
            let (info, command) = daemon.files().import_file(&path, parent).await?;
            println!("{} (command #{})", info.id, command.command_number);
        }
        CliMode::Rename { id, name } => {
            let command = daemon.files().rename(id, &name).await?;
            println!("command #{}", command.command_number);
        }
        CliMode::Remove { id } => {
            let command = daemon.files().remove(id).await?;
            println!("command #{}", command.command_number);
        }
        CliMode::Tree { parent } => {
            for document in daemon.tree().list(parent).await? {
                let marker = if document.is_folder { "/" } else { "" };
                println!("{}  {}{marker}", document.id, document.name);
            }
        }
        CliMode::Help => {}
    }
    Ok(())
}
