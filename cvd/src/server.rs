// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Request dispatch
//!
//! The listener task accepts connections; each connection is served by
//! its own task. Container operations block, so they run on the blocking
//! pool. The server exclusively owns all containers; handles never leave
//! this module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use container::{Capability, Container, Instance, PolicyManager, Quota};
use tracing::{error, info, warn};
use wire::{
    Address, Category, Connection, CreateParams, Fault, Listener, Packet, Procedure, Reply, Request, Response,
    SpawnOptions,
};

pub struct Cvd {
    inner: Arc<Shared>,
}

struct Shared {
    containers: Mutex<HashMap<String, Instance>>,
    policy: Option<PolicyManager>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    parallel_limit: usize,
}

impl Cvd {
    pub fn new(parallel_limit: usize) -> Result<Self, container::lsm::Error> {
        // Central manager, loaded once per daemon; absence degrades to
        // seccomp-only confinement
        let policy = PolicyManager::open()?;

        Ok(Self {
            inner: Arc::new(Shared {
                containers: Mutex::new(HashMap::new()),
                policy,
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                parallel_limit,
            }),
        })
    }

    pub async fn serve(&self, address: &Address) -> Result<(), wire::Error> {
        let listener = Listener::bind(address).await?;
        info!("cvd listening on {address}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(connection) => {
                            let shared = Arc::clone(&self.inner);
                            tokio::spawn(serve_connection(connection, shared));
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

        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.destroy_all().await;

        Ok(())
    }

    async fn destroy_all(&self) {
        let shared = Arc::clone(&self.inner);

        let _ = tokio::task::spawn_blocking(move || {
            let mut containers = shared.containers.lock().expect("container registry poisoned");

            for (id, mut instance) in containers.drain() {
                if let Err(e) = instance.destroy(shared.policy.as_ref()) {
                    error!("destroy {id}: {e}");
                }
            }
        })
        .await;
    }

    #[allow(dead_code)]
    pub fn parallel_limit(&self) -> usize {
        self.inner.parallel_limit
    }
}

async fn serve_connection(mut connection: Connection, shared: Arc<Shared>) {
    loop {
        let request = match connection.receive().await {
            Ok(Packet::Request(request)) => request,
            Ok(_) => continue,
            Err(wire::Error::Closed) => return,
            Err(e) => {
                warn!("connection error: {e}");
                return;
            }
        };

        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let response = handle(&shared, request).await;

        if connection.send(&Packet::Response(response)).await.is_err() {
            return;
        }
    }
}

async fn handle(shared: &Arc<Shared>, request: Request) -> Response {
    let id = request.id;
    let shared = Arc::clone(shared);

    let outcome = tokio::task::spawn_blocking(move || dispatch(&shared, request.procedure))
        .await
        .unwrap_or_else(|e| {
            Err(Fault::new(
                Category::Internal,
                format!("request worker panicked: {e}"),
            ))
        });

    if let Err(fault) = &outcome {
        warn!("request {id} failed: {fault}");
    }

    Response { id, outcome }
}

fn dispatch(shared: &Arc<Shared>, procedure: Procedure) -> Result<Reply, Fault> {
    match procedure {
        Procedure::CreateContainer { params } => create(shared, None, params).map(|container_id| Reply::ContainerCreated { container_id }),
        Procedure::CreateBatch { containers } => create_batch(shared, containers),
        Procedure::Spawn {
            container_id,
            command,
            options,
        } => spawn(shared, &container_id, &command, &options),
        Procedure::Upload {
            container_id,
            host_path,
            container_path,
        } => {
            let containers = shared.containers.lock().expect("container registry poisoned");
            let instance = containers
                .get(&container_id)
                .ok_or_else(|| Fault::new(Category::NotFound, format!("unknown container {container_id}")))?;

            instance
                .upload(&host_path, &container_path)
                .map_err(|e| Fault::new(Category::Internal, e))?;

            Ok(Reply::Uploaded)
        }
        Procedure::DestroyContainer { container_id } => destroy(shared, &container_id),
        Procedure::Install { .. } | Procedure::Remove { .. } | Procedure::GetCommand { .. } => Err(Fault::new(
            Category::InvalidArgument,
            "procedure is served by served, not cvd",
        )),
    }
}

fn create_batch(shared: &Arc<Shared>, containers: Vec<wire::BatchEntry>) -> Result<Reply, Fault> {
    let optimizer = crate::optimizer::Optimizer::new(shared.parallel_limit);

    let tasks = containers
        .into_iter()
        .map(|entry| {
            let wire::BatchEntry { name, depends_on, params } = entry;
            let shared = Arc::clone(shared);
            let container_id = name.clone();

            crate::optimizer::Task {
                name,
                depends_on,
                start: Box::new(move || {
                    create(&shared, Some(container_id), params)
                        .map(drop)
                        .map_err(|fault| fault.to_string())
                }),
            }
        })
        .collect::<Vec<_>>();

    let report = optimizer.run(tasks, &[]);

    Ok(Reply::BatchStarted {
        completed: report.completed,
        failed: report.failed,
        abandoned: report.abandoned,
    })
}

fn create(shared: &Shared, id: Option<String>, params: CreateParams) -> Result<String, Fault> {
    let id = id.unwrap_or_else(|| format!("cv-{}", shared.next_id.fetch_add(1, Ordering::SeqCst)));

    let mut builder = Container::new(&id, &params.chroot).capabilities(params.capabilities.iter().map(capability));

    for mount in &params.mounts {
        builder = if mount.read_only {
            builder.bind_ro(&mount.source, &mount.target)
        } else {
            builder.bind_rw(&mount.source, &mount.target)
        };
    }

    if let Some(quota) = params.cgroup {
        builder = builder.quota(Quota {
            cpu_percent: quota.cpu_percent,
            memory_bytes: quota.memory_bytes,
        });
    }

    if let Some(hostname) = &params.hostname {
        builder = builder.hostname(hostname);
    }

    if let Some(blob) = &params.profile {
        let profile =
            protecc::Profile::import(blob).map_err(|e| Fault::new(Category::InvalidArgument, e))?;
        builder = builder.profile(profile);
    }

    let instance = builder.start(shared.policy.as_ref()).map_err(|e| {
        let category = match &e {
            container::Error::RootInvalid { .. } => Category::InvalidArgument,
            container::Error::Policy {
                source: container::lsm::Error::MapFull,
            } => Category::ResourceExhausted,
            _ => Category::Internal,
        };
        Fault::new(category, e)
    })?;

    info!("created container {id} (pid {})", instance.pid());

    shared
        .containers
        .lock()
        .expect("container registry poisoned")
        .insert(id.clone(), instance);

    Ok(id)
}

fn spawn(shared: &Shared, container_id: &str, command: &[String], options: &SpawnOptions) -> Result<Reply, Fault> {
    let containers = shared.containers.lock().expect("container registry poisoned");
    let instance = containers
        .get(container_id)
        .ok_or_else(|| Fault::new(Category::NotFound, format!("unknown container {container_id}")))?;

    let env: Vec<(String, String)> = options.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    let pid = instance
        .spawn(command, options.cwd.as_deref(), &env)
        .map_err(|e| Fault::new(Category::Internal, e))?;

    Ok(Reply::Spawned { pid: pid as i32 })
}

fn destroy(shared: &Shared, container_id: &str) -> Result<Reply, Fault> {
    let mut containers = shared.containers.lock().expect("container registry poisoned");

    // Destroy is idempotent: an unknown id means it is already gone
    let Some(mut instance) = containers.remove(container_id) else {
        return Ok(Reply::Destroyed);
    };

    instance
        .destroy(shared.policy.as_ref())
        .map_err(|e| Fault::new(Category::Internal, e))?;

    info!("destroyed container {container_id}");

    Ok(Reply::Destroyed)
}

fn capability(capability: &wire::Capability) -> Capability {
    match capability {
        wire::Capability::Filesystem => Capability::Filesystem,
        wire::Capability::ProcessControl => Capability::ProcessControl,
        wire::Capability::Network => Capability::Network,
    }
}
