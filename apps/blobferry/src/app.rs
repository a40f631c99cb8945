//! Subcommand execution.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};

use blobferry_manager::{
    EventStream, JsonFileStore, ManagerConfig, TransferEvent, TransferFilter, TransferHandle, TransferManager,
    TransferStore,
};
use blobferry_model::{TransferId, TransferOptions, TransferState, TransferType};
use blobferry_transfer::{LocalBlobStore, calculate_file_checksum};

use crate::cli::{Cli, Command};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(cli: Cli, config: ManagerConfig) -> anyhow::Result<()> {
    match cli.command {
        Command::List { state } => list(&config, state.map(Into::into)),
        Command::Pause { id } => halt_stored(&config, id, TransferState::Paused),
        Command::Cancel { id } => halt_stored(&config, id, TransferState::Canceled),
        Command::Remove { id } => {
            let store = JsonFileStore::new(config.store_path.clone())?;
            store.delete(id)?;
            println!("{id} removed");
            Ok(())
        }
        command => {
            let remote = LocalBlobStore::new(&cli.remote_root).with_context(|| {
                format!("cannot open remote root {}", cli.remote_root.display())
            })?;
            let manager = TransferManager::open(config, Arc::new(remote))?;
            transfer(&manager, command).await
        }
    }
}

/// Runs the requested transfer together with every stored unfinished one.
async fn transfer(manager: &TransferManager, command: Command) -> anyhow::Result<()> {
    let mut events = manager
        .take_events()
        .context("event stream already taken")?;
    let restored = manager.load_context().await?;
    if restored > 0 {
        info!(restored, "resuming stored transfers");
    }

    match command {
        Command::Upload { file, target } => {
            let handle = manager
                .add_upload(file, target, TransferOptions::default())
                .await?;
            println!("{handle}");
        }
        Command::Download { source, file } => {
            let handle = manager
                .add_download(source, file, TransferOptions::default())
                .await?;
            println!("{handle}");
        }
        Command::Resume { id: Some(id) } => {
            manager.resume(&TransferHandle::new(id), None).await?;
        }
        Command::Resume { id: None } => {
            let resumed = manager.resume_all().await?;
            info!(resumed, "transfers resumed");
        }
        other => bail!("{other:?} does not start transfers"),
    }

    tokio::select! {
        () = settle(manager, &mut events) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; unfinished transfers resume on next run");
        }
    }
    manager.flush().await;
    report(manager)
}

/// Returns once no transfer is pending or in progress.
async fn settle(manager: &TransferManager, events: &mut EventStream) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            Some(event) = events.recv() => log_event(&event),
            _ = tick.tick() => {
                if !manager.transfers().iter().any(|t| t.state.is_active()) {
                    return;
                }
            }
        }
    }
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Progress { id, progress } => info!(
            transfer = %id,
            bytes = progress.bytes,
            total = progress.total_bytes,
            percent = format_args!("{:.1}", progress.as_fraction() * 100.0),
            eta_secs = ?progress.eta_secs,
            "progress"
        ),
        TransferEvent::StateChanged { id, state } => info!(transfer = %id, state = %state, "state changed"),
        TransferEvent::Failed { id, error } => warn!(transfer = %id, error = %error, "transfer failed"),
        TransferEvent::Completed { id } => info!(transfer = %id, "transfer complete"),
    }
}

fn report(manager: &TransferManager) -> anyhow::Result<()> {
    let mut failed = 0;
    for t in manager.transfers() {
        match t.state {
            TransferState::Complete if t.transfer_type == TransferType::Download => {
                let sha = calculate_file_checksum(&t.local_path)?;
                println!("{}  {}  {}  sha256:{sha}", t.id, t.state, t.blob);
            }
            TransferState::Failed => {
                failed += 1;
                let reason = t.error.as_ref().map(ToString::to_string).unwrap_or_default();
                println!("{}  {}  {}  {reason}", t.id, t.state, t.blob);
            }
            _ => println!("{}  {}  {}", t.id, t.state, t.blob),
        }
    }
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn list(config: &ManagerConfig, state: Option<TransferState>) -> anyhow::Result<()> {
    let store = JsonFileStore::new(config.store_path.clone())?;
    let stored = store.all()?;
    let filter = match state {
        Some(state) => TransferFilter::default().state(state),
        None => TransferFilter::default(),
    };
    for t in stored.blobs.iter().filter(|t| filter.matches(t)) {
        println!(
            "{}  {:<8}  {:<11}  {}/{}  {}  {}",
            t.id,
            t.transfer_type,
            t.state,
            t.transferred_bytes,
            t.total_bytes,
            t.blob,
            t.local_path.display()
        );
    }
    Ok(())
}

/// Pauses or cancels a stored transfer without running anything.
fn halt_stored(config: &ManagerConfig, id: TransferId, state: TransferState) -> anyhow::Result<()> {
    let store = JsonFileStore::new(config.store_path.clone())?;
    let stored = store.load()?;
    let mut blob = stored
        .blobs
        .into_iter()
        .find(|t| t.id == id)
        .with_context(|| format!("no unfinished transfer {id}"))?;
    blob.set_state(state)?;

    let children: HashSet<TransferId> = blob.chunk_ids.iter().copied().collect();
    let mut chunks = Vec::new();
    for mut c in stored.chunks.into_iter().filter(|c| children.contains(&c.id)) {
        let halt = match state {
            TransferState::Paused => c.state.is_active(),
            _ => !c.state.is_terminal(),
        };
        if halt {
            c.set_state(state)?;
            chunks.push(c);
        }
    }

    store.save_blob(&blob)?;
    store.save_chunks(&chunks)?;
    println!("{id} {state}");
    Ok(())
}
