/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The invocation surface: everything a caller supplies before `spawn`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::fs::Binding;
use crate::fs::BindingTable;
use crate::stdio::Stdio;

/// Host paths pre-bound read-only into the guest unless the caller overrides
/// them.
pub const DEFAULT_BINDINGS: &[&str] = &[
    "/dev/",
    "/sys/",
    "/proc/",
    "/tmp/",
    "/run/",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/hosts.equiv",
    "/etc/mtab",
    "/etc/netgroup",
    "/etc/networks",
    "/etc/passwd",
    "/etc/group",
    "/etc/localtime",
];

/// Guest mount point of the host rootfs when the emulator is in use.
pub const HOST_ROOTFS: &str = "/host-rootfs";

/// Configuration of a guest to run. Built with the consuming-builder
/// methods, consumed by [`crate::spawn`].
pub struct Config {
    /// Host directory providing the guest root. The default rootfs is `/`,
    /// which makes sense when the bind mechanism is used to relocate host
    /// files rather than to confine to a distribution tree.
    pub rootfs: PathBuf,
    /// Whether the rootfs rejects writes.
    pub rootfs_read_only: bool,
    /// Ordered bindings grafting host paths into the guest namespace.
    pub binds: Vec<Binding>,
    /// Pre-bind the paths in [`DEFAULT_BINDINGS`]. On by default.
    pub default_binds: bool,
    /// Emulator command vector; empty means native execution. Guest programs
    /// are run through this command, and the whole host rootfs is bound at
    /// [`HOST_ROOTFS`] in the guest.
    pub qemu: Vec<OsString>,
    /// Make the current kernel appear as this release in `uname`.
    pub kernel_release: Option<String>,
    /// Spoofed user id returned from getuid and substituted in stat results.
    pub uid: Option<libc::uid_t>,
    /// Spoofed group id returned from getgid and substituted in stat results.
    pub gid: Option<libc::gid_t>,
    /// Port rewrites applied to sockaddrs in `bind` and `connect`.
    pub port_map: HashMap<u16, u16>,
    /// Extra environment entries for the guest.
    pub envs: Vec<(OsString, OsString)>,
    /// Initial guest working directory.
    pub cwd: PathBuf,
    /// Guest argv. `command[0]` is resolved through the bindings.
    pub command: Vec<OsString>,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl Config {
    /// Creates a configuration rooted at the given host directory.
    pub fn new<P: Into<PathBuf>>(rootfs: P) -> Self {
        Config {
            rootfs: rootfs.into(),
            rootfs_read_only: false,
            binds: Vec::new(),
            default_binds: true,
            qemu: Vec::new(),
            kernel_release: None,
            uid: None,
            gid: None,
            port_map: HashMap::new(),
            envs: Vec::new(),
            cwd: PathBuf::from("/"),
            command: Vec::new(),
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
        }
    }

    /// Sets the guest command and its arguments.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one argument to the guest command.
    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.command.push(arg.into());
        self
    }

    /// Makes the rootfs reject writes.
    pub fn rootfs_read_only(mut self) -> Self {
        self.rootfs_read_only = true;
        self
    }

    /// Grafts the host directory `host` at the guest path `guest`.
    pub fn bind<H: Into<PathBuf>, G: Into<PathBuf>>(mut self, host: H, guest: G) -> Self {
        self.binds.push(Binding::new_dir(guest, host));
        self
    }

    /// Like [`Config::bind`] but read-only.
    pub fn bind_read_only<H: Into<PathBuf>, G: Into<PathBuf>>(
        mut self,
        host: H,
        guest: G,
    ) -> Self {
        self.binds.push(Binding::new_dir(guest, host).read_only());
        self
    }

    /// Grafts a single host file at the guest path.
    pub fn bind_file<H: Into<PathBuf>, G: Into<PathBuf>>(mut self, host: H, guest: G) -> Self {
        self.binds.push(Binding::new_file(guest, host));
        self
    }

    /// Appends a pre-built binding (archive trees come through here).
    pub fn binding(mut self, binding: Binding) -> Self {
        self.binds.push(binding);
        self
    }

    /// Disables the default read-only bindings.
    pub fn no_default_binds(mut self) -> Self {
        self.default_binds = false;
        self
    }

    /// Runs guest programs through this emulator command.
    pub fn qemu<I, S>(mut self, qemu: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.qemu = qemu.into_iter().map(Into::into).collect();
        self
    }

    /// Spoofs the kernel release reported by `uname`.
    pub fn kernel_release<S: Into<String>>(mut self, release: S) -> Self {
        self.kernel_release = Some(release.into());
        self
    }

    /// Spoofs the user and group ids.
    pub fn ids(mut self, uid: libc::uid_t, gid: libc::gid_t) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Rewrites guest port `from` to host port `to` in `bind` and `connect`.
    pub fn map_port(mut self, from: u16, to: u16) -> Self {
        self.port_map.insert(from, to);
        self
    }

    /// Adds an environment entry for the guest.
    pub fn env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the initial guest working directory.
    pub fn current_dir<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// Builds the binding table: rootfs first, then caller bindings in
    /// insertion order, then the default bindings that the caller has not
    /// overridden, then `/host-rootfs` when an emulator is configured.
    pub(crate) fn binding_table(&self) -> Result<BindingTable, Error> {
        if !self.rootfs.is_dir() {
            return Err(Error::Config(format!(
                "rootfs {:?} is not a directory",
                self.rootfs
            )));
        }

        let mut rootfs = Binding::new_dir("/", &self.rootfs);
        if self.rootfs_read_only {
            rootfs = rootfs.read_only();
        }
        let mut table = BindingTable::with_rootfs(rootfs);

        for bind in &self.binds {
            table.insert(bind.clone());
        }

        if self.default_binds {
            for default in DEFAULT_BINDINGS {
                let path = Path::new(default.trim_end_matches('/'));
                if table.is_bound(path) || !path.exists() {
                    continue;
                }
                let binding = if path.is_dir() {
                    Binding::new_dir(path, path).read_only()
                } else {
                    Binding::new_file(path, path).read_only()
                };
                table.insert(binding);
            }
        }

        if !self.qemu.is_empty() {
            table.insert(Binding::new_dir(HOST_ROOTFS, "/").read_only());
        }

        Ok(table)
    }

    /// Checks the parts of the configuration that must hold before fork.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.command.is_empty() {
            return Err(Error::Config("no guest command given".into()));
        }
        if !self.cwd.is_absolute() {
            return Err(Error::Config(format!(
                "initial working directory {:?} is not absolute",
                self.cwd
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_command_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn missing_rootfs_is_a_config_error() {
        let config = Config::new("/definitely/not/a/real/rootfs").command(["/bin/true"]);
        assert!(matches!(config.binding_table(), Err(Error::Config(_))));
    }

    #[test]
    fn caller_binding_overrides_default() {
        let dir = TempDir::new().unwrap();
        let host_tmp = TempDir::new().unwrap();
        let config = Config::new(dir.path())
            .command(["/bin/true"])
            .bind(host_tmp.path(), "/tmp");

        let table = config.binding_table().unwrap();
        let binding = table.find_guest(Path::new("/tmp/x"));
        assert_eq!(binding.host_prefix(), host_tmp.path());
        assert!(!binding.is_read_only());
    }

    #[test]
    fn default_bindings_are_read_only() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path()).command(["/bin/true"]);

        let table = config.binding_table().unwrap();
        let binding = table.find_guest(Path::new("/proc/self/status"));
        assert_eq!(binding.guest_prefix(), Path::new("/proc"));
        assert!(binding.is_read_only());
    }

    #[test]
    fn qemu_adds_host_rootfs() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path())
            .command(["/bin/true"])
            .qemu(["qemu-x86_64"]);

        let table = config.binding_table().unwrap();
        let binding = table.find_guest(Path::new("/host-rootfs/usr/bin/qemu-x86_64"));
        assert_eq!(binding.guest_prefix(), Path::new(HOST_ROOTFS));
        assert!(binding.is_read_only());
    }
}
