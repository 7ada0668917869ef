use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dealstore_backend::api::JobId;
use dealstore_backend::{Config, DealBackend};
use dealstore_common::{FileInfo, Handle, ObjectType};

const USAGE: &str = "usage: dealstore <config.toml> <command>

commands:
  init                          create a repository at the configured root
  ls <type>                     list objects of a type
  stat <type> <name>            show an object's size
  cat <type> <name> [off] [len] write an object to stdout
  put <type> <file>             store a file under the hex sha256 of its content
  rm <type> <name>              remove an object
  job <id>                      show the state of a storage deal job";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(config_path), Some(command)) = (args.first(), args.get(1)) else {
        bail!(USAGE);
    };
    let config = Config::load(&PathBuf::from(config_path))?;
    let rest = &args[2..];

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, cancelling");
            on_signal.cancel();
        }
    });

    if command == "init" {
        let (backend, job) = DealBackend::create(config, &cancel).await?;
        println!("{}", job);
        backend.close().await?;
        return Ok(());
    }

    let backend = DealBackend::open(config)?;
    let result = run(&backend, &cancel, command, rest).await;
    let closed = backend.close().await;
    result?;
    closed?;
    Ok(())
}

fn object_type(arg: Option<&String>) -> anyhow::Result<ObjectType> {
    let arg = arg.context("missing object type")?;
    Ok(ObjectType::from_str(arg)?)
}

fn handle(t: ObjectType, name: Option<&String>) -> Handle {
    match t {
        ObjectType::Config => Handle::config(),
        t => Handle::new(t, name.cloned().unwrap_or_default()),
    }
}

fn number<T: FromStr + Default>(arg: Option<&String>, what: &str) -> anyhow::Result<T> {
    match arg {
        None => Ok(T::default()),
        Some(s) => s.parse().map_err(|_| anyhow::anyhow!("invalid {}: {:?}", what, s)),
    }
}

async fn run(
    backend: &DealBackend,
    cancel: &CancellationToken,
    command: &str,
    rest: &[String],
) -> anyhow::Result<()> {
    match command {
        "ls" => {
            let t = object_type(rest.first())?;
            let mut count = 0usize;
            backend
                .list(cancel, t, &mut |info: FileInfo| -> anyhow::Result<()> {
                    println!("{}\t{}", info.name, info.size);
                    count += 1;
                    Ok(())
                })
                .await?;
            info!(count, "Listing complete");
        }
        "stat" => {
            let t = object_type(rest.first())?;
            let info = backend.stat(cancel, &handle(t, rest.get(1))).await?;
            println!("{}\t{}", info.name, info.size);
        }
        "cat" => {
            let t = object_type(rest.first())?;
            let offset: u64 = number(rest.get(2), "offset")?;
            let length: usize = number(rest.get(3), "length")?;
            let mut reader = backend.load(cancel, &handle(t, rest.get(1)), length, offset).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
        "put" => {
            let t = object_type(rest.first())?;
            let path = rest.get(1).context("missing file")?;
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let h = match t {
                ObjectType::Config => Handle::config(),
                t => Handle::new(t, hex::encode(Sha256::digest(&data))),
            };
            backend.save(cancel, &h, Bytes::from(data)).await?;
            println!("{}", h.name);
        }
        "rm" => {
            let t = object_type(rest.first())?;
            backend.remove(cancel, &handle(t, rest.get(1))).await?;
        }
        "job" => {
            let id = rest.first().context("missing job id")?;
            let state = backend.deal_status(cancel, &JobId(id.clone())).await?;
            let phase = if state.is_terminal() { "final" } else { "in progress" };
            println!("{}\t{}", state, phase);
        }
        other => bail!("unknown command {:?}\n\n{}", other, USAGE),
    }
    Ok(())
}
