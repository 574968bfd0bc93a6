// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Daemon RPC plumbing
//!
//! Chef daemons speak length-prefixed JSON packets over a local socket or
//! TCP. This crate carries the address model, the framing, and every
//! message body exchanged between `bake`, `cvd`, `served` and the
//! `serve-exec` wrapper.

pub use self::address::Address;
pub use self::connection::{Connection, Listener, Receiver, Sender};
pub use self::message::{
    BatchEntry, Capability, CgroupQuota, CommandRecord, CreateParams, Event, Fault, MountSpec, Packet, Procedure,
    Reply, Request, Response, SpawnOptions,
};
pub use self::transaction::{Phase, TransactionKind, TransactionProgress};

pub mod address;
pub mod connection;
pub mod message;
pub mod transaction;

/// Error categories surfaced verbatim to RPC clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Caller contract violation: missing input, unknown enum value,
    /// out-of-range index, malformed blob
    InvalidArgument,
    /// Missing inventory entry, unresolved ingredient, unknown container
    NotFound,
    /// Capability mismatch, unverified publisher, policy denial
    PermissionDenied,
    /// Checksum, signature or magic mismatch
    IntegrityFailure,
    /// Out of memory, disk full, map full
    ResourceExhausted,
    /// Connect/read/write errors, HTTP non-2xx, timeouts
    NetworkFailure,
    /// Invariant violation
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed address `{0}`: {1}")]
    MalformedAddress(String, &'static str),
    #[error("frame exceeds the {limit} byte limit ({size} bytes)")]
    OversizedFrame { size: usize, limit: usize },
    #[error("decode packet")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("io")]
    Io(#[from] std::io::Error),
}
