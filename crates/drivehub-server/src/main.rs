//! drivehub command-line host.
//!
//! Opens the gateway database, loads the configured drives and runs one
//! file or admin operation against the virtual tree.
//!
//! ```bash
//! drivehub drives add docs local --config '{"path": "/srv/docs"}'
//! drivehub ls docs
//! drivehub --user admin put ./report.pdf docs/report.pdf
//! drivehub grant docs g:staff rw
//! drivehub meta private --password pw --recursive 1
//! drivehub --secret password:private=pw ls private
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use drivehub_kernel::db::ADMIN_USER;
use drivehub_kernel::vfs::cache::spawn_cache_cleaner;
use drivehub_kernel::vfs::wrappers::{LoggingListener, password_key};
use drivehub_kernel::vfs::{BoxReader, open_reader, snapshot};
use drivehub_kernel::{
    CacheKind, Config, Drive, DriveRecord, DriveRegistry, Entry, EntryRef, Gateway,
    ObjectDriveFactory, PathMeta, PathMount, PathPermission, Permission, Policy, Store, TaskCtx,
};

#[derive(Parser, Debug)]
#[command(name = "drivehub")]
#[command(about = "Unified file gateway over local, memory and object-store drives")]
struct Args {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Act as this user; anonymous when omitted
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Session value, e.g. `password:private=pw`
    #[arg(long = "secret", value_name = "KEY=VALUE", global = true)]
    secrets: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls { path: Option<String> },
    /// Show one entry as JSON
    Stat { path: String },
    /// Write a file's content to stdout
    Cat { path: String },
    /// Upload a local file
    Put {
        local: PathBuf,
        path: String,
        #[arg(long)]
        overwrite: bool,
    },
    Mkdir { path: String },
    /// Copy a file or directory, across drives if needed
    Cp {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Move within one drive
    Mv {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    Rm { path: String },
    /// Manage configured drives
    Drives {
        #[command(subcommand)]
        action: Option<DrivesCommand>,
    },
    /// Rebuild all drives and reload permissions
    Reload,
    /// Set a subject's permission on a path
    Grant {
        path: String,
        /// `ANY`, `u:<user>` or `g:<group>`
        subject: String,
        /// `r`, `w`, `rw` or `-`
        permission: String,
        #[arg(long)]
        reject: bool,
    },
    /// Set path metadata
    Meta {
        path: String,
        #[arg(long, default_value = "")]
        password: String,
        #[arg(long, default_value = "")]
        sort: String,
        #[arg(long, default_value = "")]
        mode: String,
        #[arg(long, default_value = "")]
        hidden: String,
        /// Bitmask of fields that propagate to descendants
        #[arg(long, default_value_t = 0)]
        recursive: u8,
    },
    /// Alias `<path>/<name>` to another virtual path
    Mount {
        path: String,
        name: String,
        target: String,
    },
    /// Create a user, optionally in groups
    UserAdd {
        name: String,
        #[arg(long = "group")]
        groups: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DrivesCommand {
    /// List registered drive types
    Types,
    Add {
        name: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        /// Drive configuration as a JSON object
        #[arg(long, default_value = "{}")]
        config: String,
        #[arg(long)]
        disabled: bool,
    },
    Remove { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn open_gateway(config: Config) -> Result<Gateway> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        Store::open(config.db_path())
            .with_context(|| format!("failed to open {}", config.db_path().display()))?,
    );
    if store.bootstrap()? {
        eprintln!("initialised new database; admin user is `{ADMIN_USER}`");
    }

    let mut registry = DriveRegistry::builtin();
    registry.register(Arc::new(ObjectDriveFactory::in_memory()));

    let gateway = Gateway::new(store, registry, config)?.with_listener(Arc::new(LoggingListener));
    let report = gateway.reload().await?;
    for (name, reason) in &report.failed {
        tracing::warn!("drive {} unavailable: {}", name, reason);
    }
    Ok(gateway)
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    let cache_kind = config.cache.kind;
    let cleaner_interval = config.cache.cleaner_interval();

    let gateway = open_gateway(config).await?;
    let shutdown = CancellationToken::new();
    let cleaner = (cache_kind == CacheKind::Sqlite).then(|| {
        spawn_cache_cleaner(gateway.store().clone(), cleaner_interval, shutdown.clone())
    });

    let result = execute(&gateway, &args).await;

    shutdown.cancel();
    if let Some(handle) = cleaner {
        let _ = handle.await;
    }
    gateway.shutdown().await;
    result
}

fn parse_secret(secret: &str) -> Result<(&str, &str)> {
    secret
        .split_once('=')
        .ok_or_else(|| anyhow!("secret must be KEY=VALUE, got `{secret}`"))
}

/// How to pass the password for a protected path on later invocations.
fn unlock_hint(meta: &PathMeta) -> Option<String> {
    if meta.password.is_empty() {
        return None;
    }
    Some(format!("unlock with --secret {}=<password>", password_key(&meta.path)))
}

/// Task context cancelled by Ctrl-C.
fn interruptible() -> TaskCtx {
    let ctx = TaskCtx::with_observer(|p| {
        tracing::debug!(loaded = p.loaded, total = p.total, "progress");
    });
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            token.cancel();
        }
    });
    ctx
}

fn print_entry(entry: &EntryRef) {
    let kind = if entry.kind().is_dir() { "d" } else { "-" };
    let meta = entry.meta();
    let perms = format!(
        "{}{}",
        if meta.can_read { "r" } else { "-" },
        if meta.can_write { "w" } else { "-" }
    );
    println!("{kind}{perms} {:>12} {:>14} {}", entry.size(), entry.mod_time(), entry.name());
}

async fn execute(gateway: &Gateway, args: &Args) -> Result<()> {
    let mut session = gateway.session(args.user.as_deref())?;
    for secret in &args.secrets {
        let (key, value) = parse_secret(secret)?;
        session.set_value(key, value);
    }
    let drive = gateway.drive_for(&session);

    match &args.command {
        Command::Ls { path } => {
            let mut children = drive.list(path.as_deref().unwrap_or("")).await?;
            children.sort_by(|a, b| a.name().cmp(b.name()));
            for child in &children {
                print_entry(child);
            }
        }
        Command::Stat { path } => {
            let entry = drive.get(path).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot(entry.as_ref()))?);
        }
        Command::Cat { path } => {
            let entry = drive.get(path).await?;
            let mut reader = open_reader(entry.as_ref()).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
        Command::Put {
            local,
            path,
            overwrite,
        } => {
            let file = tokio::fs::File::open(local)
                .await
                .with_context(|| format!("failed to open {}", local.display()))?;
            let size = file.metadata().await?.len() as i64;
            let reader: BoxReader = Box::new(file);
            let entry = drive
                .save(&interruptible(), path, size, *overwrite, reader)
                .await?;
            print_entry(&entry);
        }
        Command::Mkdir { path } => {
            drive.make_dir(path).await?;
        }
        Command::Cp {
            src,
            dst,
            overwrite,
        } => {
            let ctx = interruptible();
            let src = drive.get(src).await?;
            let entry = drive.copy(&ctx, src, dst, *overwrite).await?;
            let progress = ctx.snapshot();
            tracing::info!("copied {} of {} entries", progress.loaded, progress.total);
            print_entry(&entry);
        }
        Command::Mv {
            src,
            dst,
            overwrite,
        } => {
            let src = drive.get(src).await?;
            let entry = drive
                .move_entry(&interruptible(), src, dst, *overwrite)
                .await?;
            print_entry(&entry);
        }
        Command::Rm { path } => {
            drive.delete(&interruptible(), path).await?;
        }
        Command::Drives { action } => drives(gateway, action.as_ref()).await?,
        Command::Reload => {
            let report = gateway.reload().await?;
            println!(
                "{} loaded, {} failed",
                report.loaded.len(),
                report.failed.len()
            );
        }
        Command::Grant {
            path,
            subject,
            permission,
            reject,
        } => {
            let permission: Permission = permission.parse().map_err(|e: String| anyhow!(e))?;
            let policy = if *reject { Policy::Reject } else { Policy::Accept };
            let rule = PathPermission::new(path.as_str(), subject.as_str(), permission, policy);
            let mut rules: Vec<PathPermission> = gateway
                .store()
                .list_permissions()?
                .into_iter()
                .filter(|r| r.path == rule.path && r.subject != rule.subject)
                .collect();
            rules.push(rule.clone());
            gateway.set_permissions(&rule.path, &rules)?;
            println!("{} {} {} on /{}", rule.policy, rule.subject, rule.permission, rule.path);
        }
        Command::Meta {
            path,
            password,
            sort,
            mode,
            hidden,
            recursive,
        } => {
            if !hidden.is_empty() {
                regex::Regex::new(hidden).context("invalid hidden pattern")?;
            }
            let meta = PathMeta {
                path: drivehub_kernel::vfs::path::clean_path(path),
                password: password.clone(),
                default_sort: sort.clone(),
                default_mode: mode.clone(),
                hidden_pattern: hidden.clone(),
                recursive: *recursive,
            };
            gateway.set_path_meta(&meta)?;
            if let Some(hint) = unlock_hint(&meta) {
                println!("{hint}");
            }
        }
        Command::Mount { path, name, target } => {
            let mount = PathMount::new(path, name, target);
            gateway.store().save_mount(&mount)?;
            gateway.reload().await?;
            println!("{} -> {}", mount.alias(), mount.mount_at);
        }
        Command::UserAdd { name, groups } => {
            let store = gateway.store();
            store.create_user(name)?;
            for group in groups {
                store.create_group(group)?;
                store.add_user_to_group(name, group)?;
            }
        }
    }
    Ok(())
}

async fn drives(gateway: &Gateway, action: Option<&DrivesCommand>) -> Result<()> {
    let store = gateway.store();
    match action {
        None => {
            let loaded = gateway.dispatcher().drive_names();
            for record in store.list_drives()? {
                let state = if !record.enabled {
                    "disabled"
                } else if loaded.contains(&record.name) {
                    "loaded"
                } else {
                    "failed"
                };
                println!("{:<16} {:<8} {}", record.name, record.kind, state);
            }
        }
        Some(DrivesCommand::Types) => {
            for info in gateway.registry().infos() {
                let fields: Vec<_> = info.config_form.iter().map(|f| f.field.as_str()).collect();
                println!("{:<8} {:<8} [{}]", info.kind, info.display_name, fields.join(", "));
            }
        }
        Some(DrivesCommand::Add {
            name,
            kind,
            config,
            disabled,
        }) => {
            if gateway.registry().get(kind).is_none() {
                bail!("unknown drive type `{kind}`");
            }
            let config: serde_json::Value =
                serde_json::from_str(config).context("drive config must be JSON")?;
            let Some(config) = config.as_object().cloned() else {
                bail!("drive config must be a JSON object");
            };
            store.save_drive(&DriveRecord {
                name: name.clone(),
                enabled: !disabled,
                kind: kind.clone(),
                config,
            })?;
            let report = gateway.reload().await?;
            if let Some((_, reason)) = report.failed.iter().find(|(n, _)| n == name) {
                bail!("drive `{name}` saved but failed to load: {reason}");
            }
        }
        Some(DrivesCommand::Remove { name }) => {
            store.delete_drive(name)?;
            gateway.reload().await?;
        }
    }
    Ok(())
}
