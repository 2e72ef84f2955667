//! `rollcall` - CLI for the child-record registry
//!
//! This binary opens a registry session over the local SQLite tree store and
//! a directory-backed object store, runs one command, and closes the session.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use rollcall::cli::{
    Cli, Command, ConfigCommand, EnsureCommand, ListCommand, MessageCommand, NormalizeCommand,
    StatusCommand, WatchCommand,
};
use rollcall::key::{closest_key, parse_display_names};
use rollcall::objects::DirObjectStore;
use rollcall::record::{ChildField, ChildRecord, ChildStatus};
use rollcall::registry::{EnsureOutcome, FieldStream, FieldValue};
use rollcall::store::SqliteTreeStore;
use rollcall::{init_logging, normalize, ChildKey, ChildKeyRegistry, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    // Execute the command
    match cli.command {
        Command::Normalize(cmd) => {
            handle_normalize(&cmd);
            Ok(())
        }
        Command::Ensure(cmd) => handle_ensure(&config, &cmd).await,
        Command::List(cmd) => handle_list(&config, &cmd).await,
        Command::Status(cmd) => handle_status(&config, &cmd).await,
        Command::Message(cmd) => handle_message(&config, &cmd).await,
        Command::Reconcile => handle_reconcile(&config).await,
        Command::Watch(cmd) => handle_watch(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

/// Open a session on the configured stores, ensuring records for `names`.
async fn open_registry(config: &Config, names: &[String]) -> anyhow::Result<ChildKeyRegistry> {
    let store = SqliteTreeStore::open(config.database_path())?;
    let objects = DirObjectStore::new(config.objects_dir());
    let registry = ChildKeyRegistry::open(
        Arc::new(store),
        Arc::new(objects),
        config.registry_settings()?,
        names,
    )
    .await
    .context("failed to open registry")?;
    Ok(registry)
}

/// Let renames started by the session finish, then close it.
async fn finish(registry: ChildKeyRegistry) {
    registry.settle().await;
    registry.close().await;
}

/// Resolve a child argument to a live key, with a hint on a near miss.
fn resolve_child(registry: &ChildKeyRegistry, name: &str) -> anyhow::Result<ChildKey> {
    if let Some(key) = registry.resolve(name) {
        return Ok(key);
    }
    let live = registry.live_keys();
    match closest_key(name, &live) {
        Some(hint) => bail!("no child named '{name}' (did you mean '{hint}'?)"),
        None => bail!("no child named '{name}'"),
    }
}

fn handle_normalize(cmd: &NormalizeCommand) {
    for name in &cmd.names {
        let key = normalize(name);
        if key.is_empty() {
            println!("{name:?} -> (no key)");
        } else {
            println!("{name:?} -> {key}");
        }
    }
}

async fn handle_ensure(config: &Config, cmd: &EnsureCommand) -> anyhow::Result<()> {
    let names = parse_display_names(&cmd.names);
    if names.is_empty() {
        bail!("no usable names in '{}'", cmd.names);
    }

    let registry = open_registry(config, &[]).await?;
    let mut failures = 0;
    for name in &names {
        let Some(key) = ChildKey::from_display_name(name) else {
            continue;
        };
        match registry.ensure_record(&key, name).await {
            Ok(EnsureOutcome::Created) => println!("created   {key}"),
            Ok(EnsureOutcome::Filled(fields)) => {
                println!("filled    {key} ({})", fields.join(", "));
            }
            Ok(EnsureOutcome::Unchanged) => println!("unchanged {key}"),
            Err(e) => {
                failures += 1;
                eprintln!("failed    {key}: {e}");
            }
        }
    }
    finish(registry).await;

    if failures > 0 {
        bail!("{failures} record(s) could not be ensured");
    }
    Ok(())
}

async fn handle_list(config: &Config, cmd: &ListCommand) -> anyhow::Result<()> {
    let registry = open_registry(config, &[]).await?;
    let records = registry.snapshot().await;
    finish(registry).await;
    let records = records?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No child records.");
        return Ok(());
    }
    println!(
        "{:<20} {:<24} {:<10} {:<24} {:>4}",
        "KEY", "NAME", "STATUS", "ETA", "MSGS"
    );
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &ChildRecord) {
    let status = record
        .status
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    let marker = if record.is_key_consistent() { "" } else { " *" };
    println!(
        "{:<20} {:<24} {:<10} {:<24} {:>4}{marker}",
        record.key.as_str(),
        record.display_name.as_deref().unwrap_or("-"),
        status,
        record.eta.as_deref().unwrap_or("-"),
        record.messages.len(),
    );
}

async fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let registry = open_registry(config, &[]).await?;
    let result = async {
        let key = resolve_child(&registry, &cmd.child)?;
        let status = ChildStatus::from(cmd.status.clone());
        registry.update_status(&key, &status).await?;
        println!("{key}: {status}");
        anyhow::Ok(())
    }
    .await;
    finish(registry).await;
    result
}

async fn handle_message(config: &Config, cmd: &MessageCommand) -> anyhow::Result<()> {
    let registry = open_registry(config, &[]).await?;
    let result = async {
        let key = resolve_child(&registry, &cmd.child)?;
        let id = registry.push_message(&key, &cmd.action, &cmd.text).await?;
        println!("{key}: message {id}");
        anyhow::Ok(())
    }
    .await;
    finish(registry).await;
    result
}

async fn handle_reconcile(config: &Config) -> anyhow::Result<()> {
    let registry = open_registry(config, &[]).await?;
    let result = async {
        let stale = stale_keys(&registry.snapshot().await?);
        for key in &stale {
            println!("stale     {key}");
        }

        registry.reconcile_now().await?;

        let remaining = stale_keys(&registry.snapshot().await?);
        for key in &remaining {
            eprintln!("remaining {key}");
        }
        println!(
            "Moved {} of {} record(s).",
            stale.len().saturating_sub(remaining.len()),
            stale.len()
        );
        anyhow::Ok(())
    }
    .await;
    finish(registry).await;
    result
}

fn stale_keys(records: &[ChildRecord]) -> Vec<ChildKey> {
    records
        .iter()
        .filter(|record| !record.is_key_consistent())
        .map(|record| record.key.clone())
        .collect()
}

async fn handle_watch(config: &Config, cmd: &WatchCommand) -> anyhow::Result<()> {
    let names = parse_display_names(&cmd.names);
    let registry = open_registry(config, &names).await?;
    let selection = cmd.select.clone().unwrap_or_default();

    let mut keys = registry.observe_keys();
    let (tx, mut rx) = mpsc::channel(16);
    let mut following = false;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        if !following {
            if let Some(key) = registry.resolve_or_first(&selection) {
                println!("following {key}");
                for field in ChildField::ALL {
                    let stream = registry.observe_field(&key, field).await?;
                    forward(stream, tx.clone());
                }
                following = true;
            }
        }

        tokio::select! {
            res = &mut interrupt => {
                res.context("failed to listen for Ctrl-C")?;
                break;
            }
            changed = keys.changed() => {
                if changed.is_err() {
                    break;
                }
                let current: Vec<String> = keys
                    .borrow_and_update()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                println!("keys      [{}]", current.join(", "));
            }
            Some((field, value)) = rx.recv() => {
                let FieldValue { key, value } = value;
                println!("{:<9} {key}: {value}", field.as_str());
            }
        }
    }

    registry.close().await;
    Ok(())
}

/// Copy a field stream's values into a shared channel until either side ends.
fn forward(mut stream: FieldStream, tx: mpsc::Sender<(ChildField, FieldValue)>) {
    tokio::spawn(async move {
        let field = stream.field();
        while let Some(value) = stream.next().await {
            if tx.send((field, value)).await.is_err() {
                break;
            }
        }
    });
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Store]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Collection root:    {}", config.store.root);
                println!();
                println!("[Objects]");
                println!("  Objects dir:        {}", config.objects_dir().display());
                println!("  Default photo:      {}", config.objects.default_photo_url);
                println!();
                println!("[Defaults]");
                println!("  ETA:                {}", config.defaults.eta);
                println!("  Status:             {}", config.defaults.status);
                println!();
                println!("[Sync]");
                println!("  Settling delay:     {}ms", config.sync.settling_delay_ms);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
