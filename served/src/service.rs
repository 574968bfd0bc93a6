// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Daemon state and request dispatch
//!
//! The service owns the inventory, the proof store, the command registry
//! and one container per installed application package. Each mutating
//! request runs as a transaction whose progress events interleave with
//! responses on the requesting connection.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use container::{Container, Instance, PolicyManager};
use inventory_store::{Inventory, Key};
use tokio::sync::mpsc;
use tracing::{info, warn};
use wire::{
    Address, Category, Fault, Listener, Packet, Phase, Procedure, Reply, Request, Response, TransactionKind,
};

use crate::commands::{CommandRegistry, InstalledCommand};
use crate::transaction::Transaction;

const PROFILE_SCRIPT: &str = "/etc/profile.d/chef.sh";
const WRAPPER_DIR: &str = "/chef/bin";

pub struct Served {
    inner: Arc<State>,
}

pub struct State {
    root: PathBuf,
    registry_endpoint: Option<url::Url>,
    inventory: Mutex<Inventory>,
    proofs: Mutex<proof::Store>,
    commands: Mutex<CommandRegistry>,
    containers: Mutex<HashMap<String, Instance>>,
    policy: Option<PolicyManager>,
    next_transaction: AtomicU64,
}

impl Served {
    pub fn open(root: PathBuf, registry_endpoint: Option<url::Url>) -> Result<Self, Error> {
        fs_err::create_dir_all(root.join("packs"))?;
        fs_err::create_dir_all(root.join("mnt"))?;
        if let Err(e) = fs_err::create_dir_all(WRAPPER_DIR) {
            warn!("cannot create {WRAPPER_DIR}: {e}");
        }

        write_profile_script();

        let inventory = Inventory::load(root.join("state.json"))?;
        let proofs = proof::Store::load(root.join("proofs.json"))?;
        let commands = CommandRegistry::load(root.join("commands.json"))?;

        let policy = PolicyManager::open()?;

        let state = Self {
            inner: Arc::new(State {
                root,
                registry_endpoint,
                inventory: Mutex::new(inventory),
                proofs: Mutex::new(proofs),
                commands: Mutex::new(commands),
                containers: Mutex::new(HashMap::new()),
                policy,
                next_transaction: AtomicU64::new(1),
            }),
        };

        state.restore_containers();

        Ok(state)
    }

    /// Containers die with the daemon, so installed applications are
    /// restarted from their unpacked images at startup
    fn restore_containers(&self) {
        let commands = self.inner.commands.lock().expect("command registry poisoned");

        let container_ids: Vec<String> = {
            let mut seen = vec![];
            for command in commands.iter() {
                if !seen.contains(&command.container_id) {
                    seen.push(command.container_id.clone());
                }
            }
            seen
        };
        drop(commands);

        for id in container_ids {
            match start_package_container(&self.inner, &id) {
                Ok(()) => info!("restored container {id}"),
                Err(e) => warn!("cannot restore container {id}: {e}"),
            }
        }
    }

    pub async fn serve(&self, address: &Address) -> Result<(), wire::Error> {
        let listener = Listener::bind(address).await?;
        info!("served listening on {address}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(connection) => {
                            let state = Arc::clone(&self.inner);
                            tokio::spawn(async move {
                                serve_connection(connection, state).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(connection: wire::Connection, state: Arc<State>) {
    let (mut receiver, mut sender) = connection.into_split();

    let (tx, mut rx) = mpsc::channel::<Packet>(64);

    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sender.send(&packet).await.is_err() {
                break;
            }
        }
    });

    loop {
        let request = match receiver.receive().await {
            Ok(Packet::Request(request)) => request,
            Ok(_) => continue,
            Err(wire::Error::Closed) => break,
            Err(e) => {
                warn!("connection error: {e}");
                break;
            }
        };

        let response = handle(&state, request, &tx).await;

        if tx.send(Packet::Response(response)).await.is_err() {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
}

async fn handle(state: &Arc<State>, request: Request, events: &mpsc::Sender<Packet>) -> Response {
    let id = request.id;

    let outcome = match request.procedure {
        Procedure::Install {
            publisher,
            package,
            channel,
        } => {
            let mut txn = Transaction::new(
                state.next_transaction.fetch_add(1, Ordering::SeqCst),
                TransactionKind::Install,
                events.clone(),
            );

            match install(state, &mut txn, &publisher, &package, &channel).await {
                Ok(()) => {
                    txn.advance(Phase::Done).await;
                    Ok(Reply::TransactionDone { transaction_id: txn.id })
                }
                Err(fault) => {
                    txn.fail(&fault).await;
                    Err(fault)
                }
            }
        }
        Procedure::Remove { publisher, package } => {
            let mut txn = Transaction::new(
                state.next_transaction.fetch_add(1, Ordering::SeqCst),
                TransactionKind::Remove,
                events.clone(),
            );

            match remove(state, &mut txn, &publisher, &package).await {
                Ok(()) => {
                    txn.advance(Phase::Done).await;
                    Ok(Reply::TransactionDone { transaction_id: txn.id })
                }
                Err(fault) => {
                    txn.fail(&fault).await;
                    Err(fault)
                }
            }
        }
        Procedure::GetCommand { invoked_path } => get_command(state, &invoked_path),
        _ => Err(Fault::new(
            Category::InvalidArgument,
            "procedure is served by cvd, not served",
        )),
    };

    if let Err(fault) = &outcome {
        warn!("request {id} failed: {fault}");
    }

    Response { id, outcome }
}

fn get_command(state: &State, invoked_path: &Path) -> Result<Reply, Fault> {
    let commands = state.commands.lock().expect("command registry poisoned");

    let command = commands
        .by_invoked_path(invoked_path)
        .ok_or_else(|| Fault::new(Category::NotFound, format!("no installed command at {}", invoked_path.display())))?;

    Ok(Reply::Command {
        record: command.record(),
    })
}

async fn install(
    state: &Arc<State>,
    txn: &mut Transaction,
    publisher: &str,
    package: &str,
    channel: &str,
) -> Result<(), Fault> {
    txn.advance(Phase::Init).await;

    // DOWNLOAD: the inventory satisfies repeat installs without touching
    // the network
    txn.advance(Phase::Download).await;

    let platform = "linux";
    let arch = std::env::consts::ARCH;

    let cached = {
        let inventory = state.inventory.lock().expect("inventory poisoned");
        let key = Key {
            publisher,
            package,
            platform,
            arch,
            channel,
            revision: 0,
        };
        inventory.latest_revision(key).and_then(|revision| {
            inventory
                .get_pack(Key { revision, ..key })
                .map(|pack| (pack.path.clone(), revision))
        })
    };

    let (pack_path, revision) = match cached {
        Some(found) => found,
        None => download(state, txn, publisher, package, channel, platform, arch).await?,
    };

    // VERIFY: full proof chain over the cached pack
    txn.advance(Phase::Verify).await;
    verify(state, publisher, package, revision, &pack_path).await?;

    // APPLY: stage the image, then swap it into place
    txn.advance(Phase::Apply).await;
    let container_id = apply(state, publisher, package, &pack_path).await?;

    // COMMIT: record the unpacked state
    txn.advance(Phase::Commit).await;
    {
        let mut inventory = state.inventory.lock().expect("inventory poisoned");
        inventory
            .set_unpacked(
                Key {
                    publisher,
                    package,
                    platform,
                    arch,
                    channel,
                    revision,
                },
                true,
            )
            .map_err(|e| Fault::new(Category::Internal, e))?;
    }

    info!("installed {publisher}/{package} revision {revision} as {container_id}");

    Ok(())
}

async fn download(
    state: &Arc<State>,
    txn: &mut Transaction,
    publisher: &str,
    package: &str,
    channel: &str,
    platform: &str,
    arch: &str,
) -> Result<(PathBuf, u64), Fault> {
    let Some(endpoint) = &state.registry_endpoint else {
        return Err(Fault::new(
            Category::NotFound,
            format!("{publisher}/{package} is not cached and no registry is configured"),
        ));
    };

    let client = registry_client::Client::new(endpoint.clone()).map_err(network_fault)?;

    let metadata = client
        .metadata(publisher, package, channel, platform, arch)
        .await
        .map_err(network_fault)?;

    let proofs = client
        .proofs(publisher, package, metadata.revision)
        .await
        .map_err(network_fault)?;

    let dest = state
        .root
        .join("packs")
        .join(format!("{publisher}-{package}-{}.pack", metadata.revision));

    txn.begin_io(metadata.size);
    {
        // The download callback is synchronous; progress events go out
        // best-effort through the channel
        let mut last = 0u64;
        client
            .download_pack(&metadata, &dest, |current, _total| {
                let delta = current.saturating_sub(last);
                last = current;
                txn.io_blocking(delta);
            })
            .await
            .map_err(network_fault)?;
    }

    {
        let mut proof_store = state.proofs.lock().expect("proof store poisoned");
        proof_store.add_publisher(proofs.publisher);
        proof_store.add_package(proofs.package);
        proof_store
            .save()
            .map_err(|e| Fault::new(Category::Internal, e))?;
    }

    {
        let mut inventory = state.inventory.lock().expect("inventory poisoned");
        inventory
            .add(inventory_store::Pack {
                publisher: publisher.to_owned(),
                package: package.to_owned(),
                platform: metadata.platform.clone(),
                arch: metadata.arch.clone(),
                channel: metadata.channel.clone(),
                revision: metadata.revision,
                path: dest.clone(),
                added: inventory_store::timestamp(),
                unpacked: false,
            })
            .map_err(|e| Fault::new(Category::Internal, e))?;
    }

    Ok((dest, metadata.revision))
}

async fn verify(
    state: &Arc<State>,
    publisher: &str,
    package: &str,
    revision: u64,
    pack_path: &Path,
) -> Result<(), Fault> {
    let (publisher_proof, package_proof) = {
        let proofs = state.proofs.lock().expect("proof store poisoned");
        (
            proofs.publisher(publisher).map_err(proof_fault)?.clone(),
            proofs.package(publisher, package, revision).map_err(proof_fault)?.clone(),
        )
    };

    let pack_path = pack_path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let root = proof::RootAuthority::compiled_in().map_err(proof_fault)?;
        proof::verify_package(&root, &publisher_proof, &package_proof, &pack_path).map_err(proof_fault)
    })
    .await
    .map_err(|e| Fault::new(Category::Internal, format!("verify worker panicked: {e}")))?
}

/// Unpack into a staging tree, swap it into place, register commands and
/// start the package container. A failure before the swap leaves the
/// previous install untouched; staged files are rolled back.
async fn apply(state: &Arc<State>, publisher: &str, package: &str, pack_path: &Path) -> Result<String, Fault> {
    let container_id = format!("{publisher}-{package}");
    let image = state.root.join("mnt").join(&container_id);
    let staging = state.root.join("mnt").join(format!(".{container_id}.staging"));

    let pack_path = pack_path.to_path_buf();
    let staging_clone = staging.clone();

    let info = tokio::task::spawn_blocking(move || -> Result<vafs::PackageInfo, Fault> {
        let mut reader = vafs::Reader::open(&pack_path).map_err(archive_fault)?;
        let info = reader
            .package()
            .cloned()
            .ok_or_else(|| Fault::new(Category::IntegrityFailure, "pack carries no package header"))?;

        if staging_clone.exists() {
            fs_err::remove_dir_all(&staging_clone).map_err(io_fault)?;
        }
        reader.unpack(&staging_clone).map_err(archive_fault)?;

        Ok(info)
    })
    .await
    .map_err(|e| Fault::new(Category::Internal, format!("apply worker panicked: {e}")))
    .and_then(|r| r);

    let info = match info {
        Ok(info) => info,
        Err(fault) => {
            let _ = fs_err::remove_dir_all(&staging);
            return Err(fault);
        }
    };

    // Swap staged image into place
    let result: Result<(), Fault> = (|| {
        let mut containers = state.containers.lock().expect("container registry poisoned");
        if let Some(mut old) = containers.remove(&container_id) {
            old.destroy(state.policy.as_ref()).map_err(|e| Fault::new(Category::Internal, e))?;
        }

        if image.exists() {
            fs_err::remove_dir_all(&image).map_err(io_fault)?;
        }
        fs_err::rename(&staging, &image).map_err(io_fault)?;

        Ok(())
    })();

    if let Err(fault) = result {
        let _ = fs_err::remove_dir_all(&staging);
        return Err(fault);
    }

    start_package_container(state, &container_id).map_err(|e| Fault::new(Category::Internal, e))?;

    register_commands(state, publisher, package, &container_id, &info)?;

    Ok(container_id)
}

/// Start (or restart) the long-lived container owning one package image
fn start_package_container(state: &State, container_id: &str) -> Result<(), container::Error> {
    let image = state.root.join("mnt").join(container_id);

    let mut containers = state.containers.lock().expect("container registry poisoned");

    if containers.contains_key(container_id) {
        return Ok(());
    }

    let instance = Container::new(container_id, image)
        .hostname(container_id)
        .capability(container::Capability::Network)
        .start(state.policy.as_ref())?;

    containers.insert(container_id.to_owned(), instance);

    Ok(())
}

fn register_commands(
    state: &State,
    publisher: &str,
    package: &str,
    container_id: &str,
    info: &vafs::PackageInfo,
) -> Result<(), Fault> {
    let wrapper = wrapper_binary();

    let mut commands = state.commands.lock().expect("command registry poisoned");

    for command in &info.commands {
        commands
            .insert(InstalledCommand {
                name: command.name.clone(),
                publisher: publisher.to_owned(),
                package: package.to_owned(),
                container_id: container_id.to_owned(),
                path: PathBuf::from("/").join(&command.path),
                arguments: command
                    .arguments
                    .split_whitespace()
                    .map(ToOwned::to_owned)
                    .collect(),
                cwd: PathBuf::from("/"),
            })
            .map_err(|e| Fault::new(Category::Internal, e))?;

        let link = PathBuf::from(WRAPPER_DIR).join(&command.name);
        if link.symlink_metadata().is_ok() {
            let _ = fs_err::remove_file(&link);
        }
        if let Err(e) = std::os::unix::fs::symlink(&wrapper, &link) {
            warn!("cannot link {}: {e}", link.display());
        }
    }

    Ok(())
}

async fn remove(
    state: &Arc<State>,
    txn: &mut Transaction,
    publisher: &str,
    package: &str,
) -> Result<(), Fault> {
    txn.advance(Phase::Init).await;
    txn.advance(Phase::Apply).await;

    let container_id = format!("{publisher}-{package}");

    let removed = {
        let mut commands = state.commands.lock().expect("command registry poisoned");
        commands
            .remove_package(publisher, package)
            .map_err(|e| Fault::new(Category::Internal, e))?
    };

    if removed.is_empty() {
        return Err(Fault::new(
            Category::NotFound,
            format!("{publisher}/{package} is not installed"),
        ));
    }

    for name in &removed {
        let _ = fs_err::remove_file(PathBuf::from(WRAPPER_DIR).join(name));
    }

    {
        let mut containers = state.containers.lock().expect("container registry poisoned");
        if let Some(mut instance) = containers.remove(&container_id) {
            instance
                .destroy(state.policy.as_ref())
                .map_err(|e| Fault::new(Category::Internal, e))?;
        }
    }

    let image = state.root.join("mnt").join(&container_id);
    if image.exists() {
        fs_err::remove_dir_all(&image).map_err(io_fault)?;
    }

    txn.advance(Phase::Commit).await;
    {
        let mut inventory = state.inventory.lock().expect("inventory poisoned");
        let keys: Vec<(String, String, String, u64)> = inventory
            .packs()
            .iter()
            .filter(|pack| pack.publisher == publisher && pack.package == package && pack.unpacked)
            .map(|pack| (pack.platform.clone(), pack.arch.clone(), pack.channel.clone(), pack.revision))
            .collect();

        for (platform, arch, channel, revision) in keys {
            inventory
                .set_unpacked(
                    Key {
                        publisher,
                        package,
                        platform: &platform,
                        arch: &arch,
                        channel: &channel,
                        revision,
                    },
                    false,
                )
                .map_err(|e| Fault::new(Category::Internal, e))?;
        }
    }

    info!("removed {publisher}/{package}");

    Ok(())
}

/// Where the wrapper symlinks point
fn wrapper_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("serve-exec")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("/usr/bin/serve-exec"))
}

/// Exported once so login shells pick up the wrapper directory
fn write_profile_script() {
    let content = "export CHEF_HOME=/chef\nexport PATH=\"$CHEF_HOME/bin:$PATH\"\n";

    if Path::new(PROFILE_SCRIPT).exists() {
        return;
    }

    match fs_err::write(PROFILE_SCRIPT, content) {
        Ok(()) => {
            let _ = fs_err::set_permissions(PROFILE_SCRIPT, std::fs::Permissions::from_mode(0o755));
        }
        Err(e) => warn!("cannot write {PROFILE_SCRIPT}: {e}"),
    }
}

fn network_fault(error: registry_client::Error) -> Fault {
    let category = match &error {
        registry_client::Error::NotFound => Category::NotFound,
        _ => Category::NetworkFailure,
    };
    Fault::new(category, error)
}

fn proof_fault(error: proof::Error) -> Fault {
    let category = if error.is_not_found() {
        Category::NotFound
    } else {
        Category::IntegrityFailure
    };
    Fault::new(category, error)
}

fn archive_fault(error: vafs::read::Error) -> Fault {
    Fault::new(Category::IntegrityFailure, error)
}

fn io_fault(error: std::io::Error) -> Fault {
    Fault::new(Category::Internal, error)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("inventory")]
    Inventory(#[from] inventory_store::Error),
    #[error("proof store")]
    Proofs(#[from] proof::store::LoadError),
    #[error("command registry")]
    Commands(#[from] crate::commands::Error),
    #[error("policy manager")]
    Policy(#[from] container::lsm::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
