/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bindings graft host paths into the guest namespace.
//!
//! A binding maps a guest-path prefix to a host-side provider. Providers come
//! in three kinds: a host directory (the common case, and what the guest
//! rootfs itself is), a single host file grafted at a guest path, and a
//! read-only archive tree (a directory snapshot that must never be mutated
//! through the guest).

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::unistd::chown;
use nix::unistd::Gid;
use nix::unistd::Uid;

use super::flags::OFlagExt;

/// The host-side backing of a binding.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Provider {
    /// A host directory; paths under the guest prefix resolve inside it.
    HostDir { root: PathBuf },

    /// A single host file; the guest path maps to exactly this file.
    HostFile { path: PathBuf },

    /// A directory snapshot treated as an immutable archive. Structurally a
    /// host directory, but every mutating capability is rejected.
    ArchiveTree { root: PathBuf },
}

impl Provider {
    /// The host path prefix backing this provider.
    pub fn host_root(&self) -> &Path {
        match self {
            Provider::HostDir { root } => root,
            Provider::HostFile { path } => path,
            Provider::ArchiveTree { root } => root,
        }
    }

    /// True when the provider backs a single file rather than a tree.
    pub fn is_file(&self) -> bool {
        matches!(self, Provider::HostFile { .. })
    }

    fn inherently_read_only(&self) -> bool {
        matches!(self, Provider::ArchiveTree { .. })
    }
}

/// One entry of the binding table: (guest prefix, provider, read-only?).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Binding {
    guest: PathBuf,
    provider: Provider,
    read_only: bool,
}

fn deny_write() -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        "binding is read-only",
    )
}

impl Binding {
    /// Binds the host directory `host` at the guest path `guest`.
    pub fn new_dir<G: Into<PathBuf>, H: Into<PathBuf>>(guest: G, host: H) -> Self {
        Binding {
            guest: guest.into(),
            provider: Provider::HostDir { root: host.into() },
            read_only: false,
        }
    }

    /// Binds the single host file `host` at the guest path `guest`.
    pub fn new_file<G: Into<PathBuf>, H: Into<PathBuf>>(guest: G, host: H) -> Self {
        Binding {
            guest: guest.into(),
            provider: Provider::HostFile { path: host.into() },
            read_only: false,
        }
    }

    /// Binds the directory snapshot `host` at `guest` as an immutable archive
    /// tree.
    pub fn new_archive<G: Into<PathBuf>, H: Into<PathBuf>>(guest: G, host: H) -> Self {
        Binding {
            guest: guest.into(),
            provider: Provider::ArchiveTree { root: host.into() },
            read_only: true,
        }
    }

    /// Marks the binding read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The guest-path prefix of this binding.
    pub fn guest_prefix(&self) -> &Path {
        &self.guest
    }

    /// The host-path prefix of this binding.
    pub fn host_prefix(&self) -> &Path {
        self.provider.host_root()
    }

    /// The provider backing this binding.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Whether writes through this binding must be rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only || self.provider.inherently_read_only()
    }

    fn host_path(&self, rel: &Path) -> io::Result<PathBuf> {
        if self.provider.is_file() {
            if rel.as_os_str().is_empty() {
                Ok(self.provider.host_root().to_path_buf())
            } else {
                Err(io::Error::from_raw_os_error(libc::ENOTDIR))
            }
        } else {
            Ok(self.provider.host_root().join(rel))
        }
    }

    /// Opens a file under this binding. `rel` is relative to the guest prefix.
    pub fn open_file(&self, rel: &Path, flags: OFlag, mode: u32) -> io::Result<File> {
        if self.is_read_only() && flags.is_write() {
            return Err(deny_write());
        }

        let path = self.host_path(rel)?;
        OpenOptions::new()
            .read(flags.is_read())
            .write(flags.is_write())
            .create(flags.create_if_not_exist())
            .custom_flags(flags.bits() & !(libc::O_CREAT | libc::O_ACCMODE))
            .mode(mode)
            .open(path)
    }

    /// Creates a directory under this binding.
    pub fn mkdir(&self, rel: &Path, mode: u32) -> io::Result<()> {
        if self.is_read_only() {
            return Err(deny_write());
        }
        let path = self.host_path(rel)?;
        fs::create_dir(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
    }

    /// Creates a symlink at `rel` pointing to `target`.
    pub fn symlink(&self, target: &Path, rel: &Path) -> io::Result<()> {
        if self.is_read_only() {
            return Err(deny_write());
        }
        symlink(target, self.host_path(rel)?)
    }

    /// Lists a directory under this binding.
    pub fn read_dir(&self, rel: &Path) -> io::Result<Vec<fs::DirEntry>> {
        fs::read_dir(self.host_path(rel)?)?.collect()
    }

    /// Stats a path under this binding without following a final symlink.
    pub fn stat(&self, rel: &Path) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(self.host_path(rel)?)
    }

    /// Changes permission bits of a path under this binding.
    pub fn chmod(&self, rel: &Path, mode: u32) -> io::Result<()> {
        if self.is_read_only() {
            return Err(deny_write());
        }
        fs::set_permissions(self.host_path(rel)?, fs::Permissions::from_mode(mode))
    }

    /// Changes ownership of a path under this binding.
    pub fn chown(&self, rel: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        if self.is_read_only() {
            return Err(deny_write());
        }
        chown(
            &self.host_path(rel)?,
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

/// The ordered set of bindings, consulted longest-guest-prefix-first. Entry 0
/// is always the guest rootfs bound at `/`.
#[derive(Debug, Clone)]
pub struct BindingTable {
    entries: Vec<Binding>,
}

impl BindingTable {
    /// Creates a table whose rootfs is the given host directory.
    pub fn new<H: Into<PathBuf>>(rootfs: H) -> Self {
        BindingTable {
            entries: vec![Binding::new_dir("/", rootfs)],
        }
    }

    /// Creates a table from a rootfs binding that may be read-only.
    pub fn with_rootfs(rootfs: Binding) -> Self {
        BindingTable {
            entries: vec![rootfs],
        }
    }

    /// The rootfs binding.
    pub fn rootfs(&self) -> &Binding {
        &self.entries[0]
    }

    /// Appends a binding. Earlier insertions win prefix-length ties.
    pub fn insert(&mut self, binding: Binding) {
        self.entries.push(binding);
    }

    /// True if some binding has exactly this guest prefix.
    pub fn is_bound(&self, guest: &Path) -> bool {
        self.entries.iter().any(|b| b.guest_prefix() == guest)
    }

    /// All entries, rootfs first.
    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.entries.iter()
    }

    /// Finds the binding with the longest guest prefix of `guest`. The rootfs
    /// binding matches everything, so this never fails for absolute paths.
    pub fn find_guest(&self, guest: &Path) -> &Binding {
        let mut best = &self.entries[0];
        let mut best_len = 0;
        for binding in &self.entries {
            if guest.starts_with(binding.guest_prefix()) {
                let len = binding.guest_prefix().as_os_str().as_bytes().len();
                if len > best_len {
                    best = binding;
                    best_len = len;
                }
            }
        }
        best
    }

    /// Finds the binding whose host prefix is the longest prefix of `host`.
    pub fn find_host(&self, host: &Path) -> Option<&Binding> {
        let mut best: Option<&Binding> = None;
        let mut best_len = 0;
        for binding in &self.entries {
            if host.starts_with(binding.host_prefix()) {
                let len = binding.host_prefix().as_os_str().as_bytes().len();
                if best.is_none() || len > best_len {
                    best = Some(binding);
                    best_len = len;
                }
            }
        }
        best
    }

    /// Substitutes a guest path with its host backing.
    pub fn to_host(&self, guest: &Path) -> (PathBuf, &Binding) {
        let binding = self.find_guest(guest);
        let rel = guest
            .strip_prefix(binding.guest_prefix())
            .expect("find_guest returned a non-prefix");
        (binding.host_prefix().join(rel), binding)
    }

    /// Substitutes a host path back to the guest view. Returns `None` for
    /// host paths outside every binding.
    pub fn to_guest(&self, host: &Path) -> Option<PathBuf> {
        let binding = self.find_host(host)?;
        let rel = host
            .strip_prefix(binding.host_prefix())
            .expect("find_host returned a non-prefix");
        Some(binding.guest_prefix().join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BindingTable {
        let mut table = BindingTable::new("/sandbox");
        table.insert(Binding::new_dir("/tmp", "/host/tmp"));
        table.insert(Binding::new_dir("/tmp/deep", "/host/deep"));
        table.insert(Binding::new_file("/etc/hosts", "/etc/hosts").read_only());
        table
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table();
        assert_eq!(
            t.find_guest(Path::new("/tmp/deep/x")).guest_prefix(),
            Path::new("/tmp/deep")
        );
        assert_eq!(
            t.find_guest(Path::new("/tmp/x")).guest_prefix(),
            Path::new("/tmp")
        );
        assert_eq!(
            t.find_guest(Path::new("/usr/bin/cat")).guest_prefix(),
            Path::new("/")
        );
    }

    #[test]
    fn prefix_match_is_componentwise() {
        let t = table();
        // "/tmpfoo" must not match the "/tmp" binding.
        assert_eq!(
            t.find_guest(Path::new("/tmpfoo")).guest_prefix(),
            Path::new("/")
        );
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let mut t = BindingTable::new("/sandbox");
        t.insert(Binding::new_dir("/data", "/first"));
        t.insert(Binding::new_dir("/data", "/second"));
        assert_eq!(
            t.find_guest(Path::new("/data/x")).host_prefix(),
            Path::new("/first")
        );
    }

    #[test]
    fn substitution_roundtrip() {
        let t = table();
        let (host, binding) = t.to_host(Path::new("/tmp/a/b"));
        assert_eq!(host, PathBuf::from("/host/tmp/a/b"));
        assert!(!binding.is_read_only());

        assert_eq!(
            t.to_guest(Path::new("/host/tmp/a/b")),
            Some(PathBuf::from("/tmp/a/b"))
        );
        assert_eq!(
            t.to_guest(Path::new("/sandbox/etc/passwd")),
            Some(PathBuf::from("/etc/passwd"))
        );
        assert_eq!(t.to_guest(Path::new("/nowhere/outside")), None);
    }

    #[test]
    fn file_binding_maps_exactly() {
        let t = table();
        let (host, binding) = t.to_host(Path::new("/etc/hosts"));
        assert_eq!(host, PathBuf::from("/etc/hosts"));
        assert!(binding.is_read_only());
        assert!(binding.provider().is_file());
    }

    #[test]
    fn archive_tree_rejects_writes() {
        let b = Binding::new_archive("/opt/pkg", "/snapshots/pkg");
        assert!(b.is_read_only());
        let err = b.mkdir(Path::new("newdir"), 0o755).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = b
            .open_file(Path::new("f"), OFlag::O_WRONLY | OFlag::O_CREAT, 0o644)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn read_only_dir_rejects_chmod_chown() {
        let b = Binding::new_dir("/x", "/host/x").read_only();
        assert_eq!(
            b.chmod(Path::new("f"), 0o600).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(
            b.chown(Path::new("f"), Some(0), None).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
    }
}
