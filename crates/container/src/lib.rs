// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Linux container engine
//!
//! Containers are built from a chroot plus a declaration-ordered set of
//! bind mounts, isolated through namespaces and optionally confined by
//! cgroup quotas, a seccomp allowlist and BPF-LSM path policy. Two modes
//! exist: [`Container::run`] executes a payload and tears everything down
//! on return, [`Container::start`] parks the container init on a control
//! socket so helper processes can join it later.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};

use fs_err as fs;
use nix::libc::SIGCHLD;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, clone};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, Signal, kill, sigaction};
use nix::sys::signalfd::SigSet;
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, Uid, close, pipe, pivot_root, read, sethostname, write};
use snafu::{ResultExt, Snafu};

use self::idmap::idmap;
pub use self::instance::Instance;
pub use self::lsm::{PolicyKey, PolicyManager};

pub mod cgroup;
pub mod control;
mod idmap;
pub mod instance;
pub mod join;
pub mod lsm;
pub mod seccomp;

const STACK_SIZE: usize = 4 * 1024 * 1024;

/// Capabilities grantable to a container. Everything not granted is
/// isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    /// Read-only view of the host filesystem at `/host`
    Filesystem,
    /// Share the host pid namespace
    ProcessControl,
    /// Share the host network namespace
    Network,
}

/// Cgroup resource quotas applied at creation
#[derive(Debug, Clone, Copy, Default)]
pub struct Quota {
    pub cpu_percent: Option<u32>,
    pub memory_bytes: Option<u64>,
}

pub struct Container {
    id: String,
    root: PathBuf,
    work_dir: Option<PathBuf>,
    binds: Vec<Bind>,
    capabilities: Vec<Capability>,
    quota: Option<Quota>,
    hostname: Option<String>,
    profile: Option<protecc::Profile>,
    ignore_host_sigint: bool,
}

impl Container {
    /// Create a new Container using the default options
    pub fn new(id: impl ToString, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            root: root.into(),
            work_dir: None,
            binds: vec![],
            capabilities: vec![],
            quota: None,
            hostname: None,
            profile: None,
            ignore_host_sigint: false,
        }
    }

    /// Override the working directory
    pub fn work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            ..self
        }
    }

    /// Create a read-write bind mount
    pub fn bind_rw(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            source: host.into(),
            target: guest.into(),
            read_only: false,
        });
        self
    }

    /// Create a read-only bind mount
    pub fn bind_ro(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            source: host.into(),
            target: guest.into(),
            read_only: true,
        });
        self
    }

    /// Grant a capability
    pub fn capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn capabilities(self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        capabilities.into_iter().fold(self, Container::capability)
    }

    /// Apply cgroup quotas
    pub fn quota(self, quota: Quota) -> Self {
        Self {
            quota: Some(quota),
            ..self
        }
    }

    /// Override hostname
    pub fn hostname(self, hostname: impl ToString) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..self
        }
    }

    /// Attach a compiled security profile. The profile enables the seccomp
    /// filter and, where available, populates the BPF-LSM policy map.
    pub fn profile(self, profile: protecc::Profile) -> Self {
        Self {
            profile: Some(profile),
            ..self
        }
    }

    /// Ignore `SIGINT` from the parent process so it can be forwarded to a
    /// spawned process inside the container with [`forward_sigint`]
    pub fn ignore_host_sigint(self, ignore: bool) -> Self {
        Self {
            ignore_host_sigint: ignore,
            ..self
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bind mount targets in declaration order
    pub fn mount_plan(&self) -> Vec<&Path> {
        self.binds.iter().map(|bind| bind.target.as_path()).collect()
    }

    fn networking(&self) -> bool {
        self.capabilities.contains(&Capability::Network)
    }

    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;

        if !Uid::effective().is_root() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if !self.capabilities.contains(&Capability::ProcessControl) {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if !self.networking() {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        flags
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.root.is_dir() {
            return Err(Error::RootInvalid {
                root: self.root.clone(),
            });
        }
        Ok(())
    }

    /// Run `f` as a one-shot container payload, tearing the container down
    /// when it returns
    pub fn run<E>(self, mut f: impl FnMut() -> Result<(), E>) -> Result<(), Error>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.validate()?;

        let rootless = !Uid::effective().is_root();

        // Pipes to synchronize parent & child
        let sync = pipe().context(NixSnafu)?;
        let status = pipe().context(NixSnafu)?;

        let mut stack = vec![0u8; STACK_SIZE];

        let clone_cb = Box::new(|| match enter(&self, sync.0, status.1, None, &mut f) {
            Ok(_) => 0,
            Err(error) => {
                report_error(status.1, error);
                1
            }
        });
        let pid = unsafe { clone(clone_cb, &mut stack, self.clone_flags(), Some(SIGCHLD)) }.context(NixSnafu)?;

        // Map current user to root in the container before anything else
        // happens in the new user namespace
        if rootless {
            idmap(pid).context(IdmapSnafu)?;
        }

        // Allow child to continue, telling it its host-visible pid; the
        // parent half of the pipes is done with
        write(sync.1, &[Message::Continue as u8]).context(NixSnafu)?;
        write(sync.1, &(pid.as_raw() as u32).to_be_bytes()).context(NixSnafu)?;
        close(sync.1).context(NixSnafu)?;
        close(status.1).context(NixSnafu)?;

        if self.ignore_host_sigint {
            ignore_sigint().context(NixSnafu)?;
        }

        let result = wait_for_exit(pid, status.0);

        if self.ignore_host_sigint {
            default_sigint().context(NixSnafu)?;
        }

        result
    }

    /// Start a long-lived container. The init process parks on the control
    /// socket under [`control::socket_path`] until destroyed; helpers join
    /// through it. Every policy map entry is in place before the init
    /// proceeds past the sync barrier.
    pub fn start(self, policy: Option<&PolicyManager>) -> Result<Instance, Error> {
        self.validate()?;

        let rootless = !Uid::effective().is_root();

        let cgroup = match cgroup::Cgroup::create(&self.id, self.quota.unwrap_or_default()) {
            Ok(cgroup) => Some(cgroup),
            // Quota-less containers may run unconfined on hosts without a
            // writable cgroup hierarchy
            Err(e) if self.quota.is_none() => {
                tracing::info!("cgroup unavailable, container {} runs unconfined: {e}", self.id);
                None
            }
            Err(e) => return Err(Error::Cgroup { source: e }),
        };

        let sync = pipe().context(NixSnafu)?;
        let status = pipe().context(NixSnafu)?;

        let mut stack = vec![0u8; STACK_SIZE];
        let mut park = control::never_run_payload;

        let clone_cb = Box::new(|| match enter(&self, sync.0, status.1, Some(self.id.as_str()), &mut park) {
            Ok(_) => 0,
            Err(error) => {
                report_error(status.1, error);
                1
            }
        });
        let pid = unsafe { clone(clone_cb, &mut stack, self.clone_flags(), Some(SIGCHLD)) }.context(NixSnafu)?;

        let prepared = (|| {
            if rootless {
                idmap(pid).context(IdmapSnafu)?;
            }

            if let Some(cgroup) = &cgroup {
                cgroup.add_pid(pid).context(CgroupSnafu)?;
            }

            // Populate the policy map before the init passes the barrier
            let mut entries = 0;
            if let (Some(manager), Some(profile), Some(cgroup)) = (policy, &self.profile, &cgroup) {
                entries = manager
                    .populate(cgroup.id(), &self.root, profile)
                    .context(PolicySnafu)?;
            }

            write(sync.1, &[Message::Continue as u8]).context(NixSnafu)?;
            write(sync.1, &(pid.as_raw() as u32).to_be_bytes()).context(NixSnafu)?;
            close(sync.1).context(NixSnafu)?;
            close(status.1).context(NixSnafu)?;

            wait_for_ready(status.0)?;

            Ok(entries)
        })();

        match prepared {
            Ok(policy_entries) => Ok(Instance::new(
                self.id,
                pid,
                self.root,
                self.binds,
                cgroup,
                policy_entries,
            )),
            Err(error) => {
                // All-or-nothing: rewind everything the parent set up. The
                // child's namespaces and mounts die with it.
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                if let (Some(manager), Some(cgroup)) = (policy, &cgroup) {
                    let _ = manager.remove_container(cgroup.id());
                }
                if let Some(cgroup) = cgroup {
                    let _ = cgroup.destroy();
                }
                let _ = control::remove_socket(&self.id);
                Err(error)
            }
        }
    }
}

/// Reenter the container
fn enter<E>(
    container: &Container,
    sync_read: i32,
    status_write: i32,
    persist_id: Option<&str>,
    f: &mut impl FnMut() -> Result<(), E>,
) -> Result<(), ContainerError>
where
    E: std::error::Error + Send + Sync + 'static,
{
    // Ensure process is cleaned up if parent dies
    set_pdeathsig(Signal::SIGKILL).context(SetPDeathSigSnafu)?;

    // Wait for continue message; it carries our host-visible pid, which
    // a pid namespace hides from getpid()
    let mut message = [0u8; 5];
    let mut filled = 0;
    while filled < message.len() {
        let n = read(sync_read, &mut message[filled..]).context(ReadContinueMsgSnafu)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    assert_eq!(message[0], Message::Continue as u8);
    let host_pid = u32::from_be_bytes(message[1..5].try_into().expect("four pid bytes"));

    // Close unused read end
    close(sync_read).context(CloseReadFdSnafu)?;

    // The control socket lives on the host filesystem, bind it before the
    // pivot while we can still see that path
    let listener = persist_id
        .map(|id| control::bind_socket(id).context(ControlSnafu))
        .transpose()?;

    setup(container)?;

    if container.profile.is_some() {
        seccomp::install_allowlist().context(SeccompSnafu)?;
    }

    if let Some(listener) = listener {
        // Signal readiness only once every mount and policy is in place
        write(status_write, &[Message::Ready as u8]).context(NotifyReadySnafu)?;

        return control::park(listener, host_pid).context(ControlSnafu);
    }

    f().boxed().context(RunSnafu)
}

/// Setup the container
fn setup(container: &Container) -> Result<(), ContainerError> {
    if container.networking() {
        setup_networking(&container.root)?;
    }

    setup_localhost()?;

    pivot(container)?;

    if let Some(hostname) = &container.hostname {
        sethostname(hostname).context(SetHostnameSnafu)?;
    }

    if let Some(dir) = &container.work_dir {
        set_current_dir(dir)?;
    }

    Ok(())
}

/// Pivot the process into the rootfs, applying bind mounts in declaration
/// order
fn pivot(container: &Container) -> Result<(), ContainerError> {
    const OLD_PATH: &str = "old_root";

    let root = &container.root;
    let old_root = root.join(OLD_PATH);

    add_mount(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE)?;
    add_mount(Some(root), root, None, MsFlags::MS_BIND)?;

    for bind in &container.binds {
        let source = bind.source.canonicalize().context(FsErrSnafu)?;
        let target = root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target));

        add_mount(Some(&source), &target, None, MsFlags::MS_BIND)?;

        // Remount to enforce readonly flag
        if bind.read_only {
            add_mount(
                Some(source),
                target,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )?;
        }
    }

    if container.capabilities.contains(&Capability::Filesystem) {
        let host_view = root.join("host");
        add_mount(Some(Path::new("/")), &host_view, None, MsFlags::MS_BIND | MsFlags::MS_REC)?;
        add_mount(
            Some(Path::new("/")),
            &host_view,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        )?;
    }

    ensure_directory(&old_root)?;
    pivot_root(root, &old_root).context(PivotRootSnafu)?;

    set_current_dir("/")?;

    add_mount(Some("proc"), "proc", Some("proc"), MsFlags::empty())?;
    add_mount(Some("tmpfs"), "tmp", Some("tmpfs"), MsFlags::empty())?;
    add_mount(
        Some(format!("/{OLD_PATH}/sys").as_str()),
        "sys",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;
    add_mount(
        Some(format!("/{OLD_PATH}/dev").as_str()),
        "dev",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;

    umount2(OLD_PATH, MntFlags::MNT_DETACH).context(UnmountOldRootSnafu)?;
    fs::remove_dir(OLD_PATH).context(FsErrSnafu)?;

    umask(Mode::S_IWGRP | Mode::S_IWOTH);

    Ok(())
}

fn setup_networking(root: &Path) -> Result<(), ContainerError> {
    ensure_directory(root.join("etc"))?;
    fs::copy("/etc/resolv.conf", root.join("etc/resolv.conf")).context(FsErrSnafu)?;
    Ok(())
}

fn setup_localhost() -> Result<(), ContainerError> {
    if PathBuf::from("/usr/sbin/ip").exists() {
        Command::new("/usr/sbin/ip")
            .args(["link", "set", "lo", "up"])
            .output()
            .context(SetupLocalhostSnafu)?;
    }
    Ok(())
}

fn ensure_directory(path: impl AsRef<Path>) -> Result<(), ContainerError> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).context(FsErrSnafu)?;
    }
    Ok(())
}

fn add_mount<T: AsRef<Path>>(
    source: Option<T>,
    target: T,
    fs_type: Option<&str>,
    flags: MsFlags,
) -> Result<(), ContainerError> {
    let target = target.as_ref();
    ensure_directory(target)?;
    mount(
        source.as_ref().map(AsRef::as_ref),
        target,
        fs_type,
        flags,
        Option::<&str>::None,
    )
    .with_context(|_| MountSnafu {
        target: target.to_owned(),
    })?;
    Ok(())
}

fn set_current_dir(path: impl AsRef<Path>) -> Result<(), ContainerError> {
    let path = path.as_ref();
    std::env::set_current_dir(path).with_context(|_| SetCurrentDirSnafu { path: path.to_owned() })
}

fn wait_for_exit(pid: Pid, status_read: i32) -> Result<(), Error> {
    let status = waitpid(pid, None).context(NixSnafu)?;

    match status {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(_, _) => Err(Error::Failure {
            message: drain_error(status_read),
        }),
        WaitStatus::Signaled(_, signal, _) => Err(Error::Signaled { signal }),
        WaitStatus::Stopped(_, _)
        | WaitStatus::PtraceEvent(_, _, _)
        | WaitStatus::PtraceSyscall(_)
        | WaitStatus::Continued(_)
        | WaitStatus::StillAlive => Err(Error::UnknownExit),
    }
}

fn wait_for_ready(status_read: i32) -> Result<(), Error> {
    let mut message = [0u8; 1];

    match read(status_read, &mut message) {
        Ok(1) if message[0] == Message::Ready as u8 => Ok(()),
        // Closed or errored: the child wrote its failure and exited
        _ => Err(Error::Failure {
            message: drain_error(status_read),
        }),
    }
}

fn drain_error(status_read: i32) -> String {
    let mut error = String::new();
    let mut buffer = [0u8; 1024];

    while let Ok(len) = read(status_read, &mut buffer) {
        if len == 0 {
            break;
        }
        error.push_str(String::from_utf8_lossy(&buffer[..len]).as_ref());
    }

    error
}

fn report_error(status_write: i32, error: ContainerError) {
    let error = format_error(error);
    let mut pos = 0;

    while pos < error.len() {
        let Ok(len) = write(status_write, &error.as_bytes()[pos..]) else {
            break;
        };

        pos += len;
    }

    let _ = close(status_write);
}

fn ignore_sigint() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action)? };
    Ok(())
}

fn default_sigint() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action)? };
    Ok(())
}

/// Forwards `SIGINT` from the current process to the [`Pid`] process
pub fn forward_sigint(pid: Pid) -> Result<(), nix::Error> {
    static PID: AtomicI32 = AtomicI32::new(0);

    PID.store(pid.as_raw(), Ordering::Relaxed);

    extern "C" fn on_int(_: i32) {
        let pid = Pid::from_raw(PID.load(Ordering::Relaxed));
        let _ = kill(pid, Signal::SIGINT);
    }

    let action = SigAction::new(SigHandler::Handler(on_int), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action)? };

    Ok(())
}

fn format_error(error: impl std::error::Error) -> String {
    let sources = sources(&error);
    sources.join(": ")
}

fn sources(error: &dyn std::error::Error) -> Vec<String> {
    let mut sources = vec![error.to_string()];
    let mut source = error.source();
    while let Some(error) = source.take() {
        sources.push(error.to_string());
        source = error.source();
    }
    sources
}

#[derive(Debug, Clone)]
pub(crate) struct Bind {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("chroot is not a directory: {}", root.display()))]
    RootInvalid { root: PathBuf },
    #[snafu(display("exited with failure: {message}"))]
    Failure { message: String },
    #[snafu(display("stopped by signal: {signal}"))]
    Signaled { signal: Signal },
    #[snafu(display("unknown exit reason"))]
    UnknownExit,
    #[snafu(display("error setting up rootless id map"))]
    Idmap { source: idmap::Error },
    #[snafu(display("cgroup"))]
    Cgroup { source: cgroup::Error },
    #[snafu(display("policy map"))]
    Policy { source: lsm::Error },
    #[snafu(display("nix"))]
    Nix { source: nix::Error },
}

#[derive(Debug, Snafu)]
enum ContainerError {
    #[snafu(display("run"))]
    Run {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[snafu(display("set current dir"))]
    SetCurrentDirError { path: PathBuf, source: io::Error },
    #[snafu(display("setup localhost"))]
    SetupLocalhost { source: io::Error },
    #[snafu(display("set_pdeathsig"))]
    SetPDeathSig { source: nix::Error },
    #[snafu(display("wait for continue message"))]
    ReadContinueMsg { source: nix::Error },
    #[snafu(display("close read end of pipe"))]
    CloseReadFd { source: nix::Error },
    #[snafu(display("notify ready"))]
    NotifyReady { source: nix::Error },
    #[snafu(display("sethostname"))]
    SetHostname { source: nix::Error },
    #[snafu(display("pivot_root"))]
    PivotRoot { source: nix::Error },
    #[snafu(display("unmount old root"))]
    UnmountOldRoot { source: nix::Error },
    #[snafu(display("mount {}", target.display()))]
    Mount { target: PathBuf, source: nix::Error },
    #[snafu(display("seccomp"))]
    Seccomp { source: seccomp::Error },
    #[snafu(display("control socket"))]
    ControlError { source: control::Error },
    #[snafu(display("filesystem"))]
    FsErr { source: io::Error },
}

#[repr(u8)]
enum Message {
    Continue = 1,
    Ready = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_plan_keeps_declaration_order() {
        let container = Container::new("test", "/tmp")
            .bind_ro("/srv/a", "/a")
            .bind_rw("/srv/b", "/b")
            .bind_ro("/srv/c", "/c");

        assert_eq!(
            container.mount_plan(),
            vec![Path::new("/a"), Path::new("/b"), Path::new("/c")]
        );
    }

    #[test]
    fn capabilities_deduplicate() {
        let container = Container::new("test", "/tmp")
            .capability(Capability::Network)
            .capability(Capability::Network);

        assert_eq!(container.capabilities, vec![Capability::Network]);
    }

    #[test]
    fn network_capability_keeps_host_namespace() {
        let isolated = Container::new("a", "/tmp");
        let shared = Container::new("b", "/tmp").capability(Capability::Network);

        assert!(isolated.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(!shared.clone_flags().contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn invalid_root_is_rejected() {
        let container = Container::new("test", "/nonexistent/chroot");

        assert!(matches!(container.validate(), Err(Error::RootInvalid { .. })));
    }
}
