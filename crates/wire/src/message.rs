// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! RPC message bodies

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::transaction::TransactionProgress;
use crate::Category;

/// Top level frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "packet", rename_all = "snake_case")]
pub enum Packet {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub procedure: Procedure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub outcome: Result<Reply, Fault>,
}

/// Server initiated notifications, outside the request/response pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TransactionIoProgress(TransactionProgress),
}

/// A request failure surfaced to the client. The category is carried
/// verbatim; the message is advisory.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{category}: {message}")]
pub struct Fault {
    pub category: Category,
    pub message: String,
}

impl Fault {
    pub fn new(category: Category, message: impl ToString) -> Self {
        Self {
            category,
            message: message.to_string(),
        }
    }
}

/// Tagged procedure calls accepted by the daemons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "procedure", rename_all = "snake_case")]
pub enum Procedure {
    // cvd
    CreateContainer {
        params: CreateParams,
    },
    /// Start a batch of containers through the startup optimizer
    CreateBatch {
        containers: Vec<BatchEntry>,
    },
    Spawn {
        container_id: String,
        command: Vec<String>,
        options: SpawnOptions,
    },
    Upload {
        container_id: String,
        host_path: PathBuf,
        container_path: PathBuf,
    },
    DestroyContainer {
        container_id: String,
    },

    // served
    Install {
        publisher: String,
        package: String,
        channel: String,
    },
    Remove {
        publisher: String,
        package: String,
    },
    GetCommand {
        /// Path the wrapper binary was invoked as
        invoked_path: PathBuf,
    },
}

/// One member of a batch creation request. The name doubles as the
/// container id and feeds the priority heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub params: CreateParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    ContainerCreated { container_id: String },
    BatchStarted {
        completed: Vec<String>,
        failed: Vec<String>,
        abandoned: Vec<String>,
    },
    Spawned { pid: i32 },
    Uploaded,
    Destroyed,
    TransactionDone { transaction_id: u64 },
    Command { record: CommandRecord },
}

/// Container capabilities grantable at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    Filesystem,
    ProcessControl,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CgroupQuota {
    /// `cpu.max` quota in percent of one cpu, unlimited when absent
    pub cpu_percent: Option<u32>,
    /// `memory.max` in bytes, unlimited when absent
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParams {
    pub chroot: PathBuf,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub cgroup: Option<CgroupQuota>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Exported path-profile blob applied to the container
    #[serde(default)]
    pub profile: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Everything `serve-exec` needs to run an installed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub container_id: String,
    /// Executable path inside the container
    pub path: PathBuf,
    pub arguments: Vec<String>,
    pub cwd: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedure_roundtrip() {
        let request = Request {
            id: 7,
            procedure: Procedure::Spawn {
                container_id: "editor-2".into(),
                command: vec!["/usr/bin/make".into(), "-j4".into()],
                options: SpawnOptions {
                    cwd: Some("/chef/build".into()),
                    env: BTreeMap::from([("LANG".into(), "C.UTF-8".into())]),
                },
            },
        };

        let bytes = serde_json::to_vec(&Packet::Request(request)).unwrap();
        let decoded: Packet = serde_json::from_slice(&bytes).unwrap();

        let Packet::Request(decoded) = decoded else {
            panic!("expected request");
        };
        assert_eq!(decoded.id, 7);
        assert!(matches!(decoded.procedure, Procedure::Spawn { .. }));
    }

    #[test]
    fn fault_roundtrip() {
        let response = Response {
            id: 3,
            outcome: Err(Fault::new(Category::NotFound, "unknown container")),
        };

        let bytes = serde_json::to_vec(&Packet::Response(response)).unwrap();
        let Packet::Response(decoded) = serde_json::from_slice(&bytes).unwrap() else {
            panic!("expected response");
        };

        assert_eq!(decoded.outcome.unwrap_err().category, Category::NotFound);
    }
}
