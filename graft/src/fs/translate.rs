/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Guest ↔ host path translation.
//!
//! Forward translation canonicalizes a guest path against the tracee's guest
//! CWD, walks symlinks with guest-side semantics (a symlink target read from
//! the host backing is reinterpreted as a guest path), and substitutes the
//! longest-matching binding prefix. Reverse translation maps kernel-returned
//! host paths (readlink, getcwd) back into the guest view.

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use syscalls::Errno;

use super::binding::BindingTable;

/// The kernel path limit, including the NUL terminator.
pub const PATH_MAX: usize = 4096;

/// The kernel's bound on symlink expansions for one lookup.
pub const MAXSYMLINKS: usize = 40;

/// Whether the final component of a path should be dereferenced.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Follow {
    /// Dereference a final symlink (stat, open, chdir, ...).
    Final,
    /// Leave a final symlink alone (lstat, readlink, unlink, rename, ...).
    NotFinal,
}

/// The outcome of a forward translation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Translated {
    /// The host path to hand to the kernel.
    pub host: PathBuf,
    /// The canonicalized guest path the host path was derived from.
    pub guest: PathBuf,
    /// Whether the selected binding rejects writes.
    pub read_only: bool,
}

/// A tracee's view of the filesystem: the shared binding table plus its own
/// guest working directory.
pub struct FsView<'a> {
    pub bindings: &'a BindingTable,
    pub cwd: &'a Path,
}

/// Lexically collapses `.` and `..` without consulting the filesystem. The
/// input must be absolute; `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(c) => result.push(c),
        }
    }
    result
}

impl<'a> FsView<'a> {
    /// Translates a guest path to the host path to inject into the tracee.
    pub fn translate(&self, guest: &Path, follow: Follow) -> Result<Translated, Errno> {
        if guest.as_os_str().is_empty() {
            // An empty path is ENOENT everywhere; let the kernel say so by
            // handing it through untouched is not possible (no binding), so
            // inject the errno directly.
            return Err(Errno::ENOENT);
        }
        if guest.as_os_str().as_bytes().len() >= PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        let absolute = if guest.is_absolute() {
            guest.to_path_buf()
        } else {
            self.cwd.join(guest)
        };

        let mut expansions = 0;
        let canonical = self.canonicalize(&normalize(&absolute), follow, &mut expansions)?;

        let (host, binding) = self.bindings.to_host(&canonical);
        if host.as_os_str().as_bytes().len() >= PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        Ok(Translated {
            host,
            guest: canonical,
            read_only: binding.is_read_only(),
        })
    }

    /// Reverse translation: maps a host path back to the guest view. Host
    /// paths outside every binding are returned unchanged (the guest is
    /// allowed to see them; they simply have no guest-side alias).
    pub fn detranslate(&self, host: &Path) -> PathBuf {
        match self.bindings.to_guest(host) {
            Some(guest) => normalize(&guest),
            None => host.to_path_buf(),
        }
    }

    /// Walks a normalized absolute guest path component by component,
    /// expanding symlinks through the host backing. Returns the canonical
    /// guest path.
    fn canonicalize(
        &self,
        guest: &Path,
        follow: Follow,
        expansions: &mut usize,
    ) -> Result<PathBuf, Errno> {
        let components: Vec<&std::ffi::OsStr> = guest
            .components()
            .filter_map(|c| match c {
                Component::Normal(c) => Some(c),
                _ => None,
            })
            .collect();

        let mut result = PathBuf::from("/");

        for (i, component) in components.iter().enumerate() {
            let is_final = i + 1 == components.len();
            let candidate = result.join(component);

            if is_final && follow == Follow::NotFinal {
                result = candidate;
                break;
            }

            let (host, _) = self.bindings.to_host(&candidate);
            match fs::symlink_metadata(&host) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    *expansions += 1;
                    if *expansions > MAXSYMLINKS {
                        return Err(Errno::ELOOP);
                    }

                    let target = fs::read_link(&host).map_err(io_errno)?;
                    let expanded = if target.is_absolute() {
                        target
                    } else {
                        result.join(target)
                    };

                    // Re-walk from the expansion with the unvisited suffix
                    // appended.
                    let mut rest = expanded;
                    for remaining in &components[i + 1..] {
                        rest.push(remaining);
                    }
                    if rest.as_os_str().as_bytes().len() >= PATH_MAX {
                        return Err(Errno::ENAMETOOLONG);
                    }
                    return self.canonicalize(&normalize(&rest), follow, expansions);
                }
                // Nonexistent intermediate components are left for the kernel
                // to report; anything else is a plain component.
                _ => result = candidate,
            }
        }

        Ok(result)
    }
}

fn io_errno(err: std::io::Error) -> Errno {
    Errno::new(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Converts the bytes of a peeked tracee string into a path.
pub fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;
    use tempfile::TempDir;

    use super::*;
    use crate::fs::binding::Binding;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/a/..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/")), PathBuf::from("/"));
    }

    fn sandbox() -> (TempDir, BindingTable) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        std::fs::write(dir.path().join("etc/hostname"), "guest-host\n").unwrap();
        let table = BindingTable::new(dir.path());
        (dir, table)
    }

    #[test]
    fn translate_relative_against_cwd() {
        let (dir, table) = sandbox();
        let view = FsView {
            bindings: &table,
            cwd: Path::new("/etc"),
        };

        let translated = view.translate(Path::new("hostname"), Follow::Final).unwrap();
        assert_eq!(translated.host, dir.path().join("etc/hostname"));
        assert_eq!(translated.guest, PathBuf::from("/etc/hostname"));
        assert!(!translated.read_only);
    }

    #[test]
    fn translate_through_symlink() {
        let (dir, table) = sandbox();
        // /link -> /etc inside the guest.
        std::os::unix::fs::symlink("/etc", dir.path().join("link")).unwrap();

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        let translated = view
            .translate(Path::new("/link/hostname"), Follow::Final)
            .unwrap();
        assert_eq!(translated.host, dir.path().join("etc/hostname"));
        assert_eq!(translated.guest, PathBuf::from("/etc/hostname"));
    }

    #[test]
    fn symlink_escape_stays_in_guest() {
        let (dir, table) = sandbox();
        // A guest symlink pointing above the rootfs must be reinterpreted
        // inside the guest, not escape to the host root.
        std::os::unix::fs::symlink("/../../..", dir.path().join("escape")).unwrap();

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        let translated = view
            .translate(Path::new("/escape/etc/hostname"), Follow::Final)
            .unwrap();
        assert_eq!(translated.host, dir.path().join("etc/hostname"));
    }

    #[test]
    fn nofollow_leaves_final_symlink() {
        let (dir, table) = sandbox();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join("alias")).unwrap();

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        let translated = view
            .translate(Path::new("/alias"), Follow::NotFinal)
            .unwrap();
        assert_eq!(translated.host, dir.path().join("alias"));

        let translated = view.translate(Path::new("/alias"), Follow::Final).unwrap();
        assert_eq!(translated.host, dir.path().join("etc/hostname"));
    }

    #[test]
    fn symlink_chain_bound() {
        let (dir, table) = sandbox();
        // A chain of exactly MAXSYMLINKS resolves; one more is ELOOP.
        std::fs::write(dir.path().join("target"), "x").unwrap();
        std::os::unix::fs::symlink("/target", dir.path().join("chain0")).unwrap();
        for i in 1..=MAXSYMLINKS {
            std::os::unix::fs::symlink(
                format!("/chain{}", i - 1),
                dir.path().join(format!("chain{}", i)),
            )
            .unwrap();
        }

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        let ok = view
            .translate(
                Path::new(&format!("/chain{}", MAXSYMLINKS - 1)),
                Follow::Final,
            )
            .unwrap();
        assert_eq!(ok.host, dir.path().join("target"));

        let err = view
            .translate(Path::new(&format!("/chain{}", MAXSYMLINKS)), Follow::Final)
            .unwrap_err();
        assert_eq!(err, Errno::ELOOP);
    }

    #[test]
    fn cyclic_symlink_is_eloop() {
        let (dir, table) = sandbox();
        std::os::unix::fs::symlink("/b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("/a", dir.path().join("b")).unwrap();

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        assert_eq!(
            view.translate(Path::new("/a"), Follow::Final).unwrap_err(),
            Errno::ELOOP
        );
    }

    #[test]
    fn path_length_boundary() {
        let (dir, table) = sandbox();
        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        // Room for the host prefix must remain under PATH_MAX as well, so the
        // boundary on the guest side alone is checked with a name that still
        // fits after substitution.
        let just_fits = PATH_MAX - 1 - dir.path().as_os_str().len() - 2;
        let name = "a".repeat(just_fits);
        let path = format!("/{}", name);
        assert!(view.translate(Path::new(&path), Follow::Final).is_ok());

        let too_long = "a".repeat(PATH_MAX);
        let path = format!("/{}", too_long);
        assert_eq!(
            view.translate(Path::new(&path), Follow::Final).unwrap_err(),
            Errno::ENAMETOOLONG
        );
    }

    #[test]
    fn detranslate_reverses_bindings() {
        let (dir, mut table) = sandbox();
        table.insert(Binding::new_dir("/tmp", "/host-tmp"));

        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        assert_eq!(
            view.detranslate(&dir.path().join("etc/hostname")),
            PathBuf::from("/etc/hostname")
        );
        assert_eq!(
            view.detranslate(Path::new("/host-tmp/x")),
            PathBuf::from("/tmp/x")
        );
    }

    #[quickcheck]
    fn prop_reverse_of_translate_is_normalized_input(parts: Vec<String>) -> bool {
        // Build a guest path of plain components (no dots, no NULs, no
        // slashes) and check reverse(translate(p)) == normalize(p). Symlinks
        // are not involved because the components don't exist on disk.
        let (_dir, table) = sandbox();
        let view = FsView {
            bindings: &table,
            cwd: Path::new("/"),
        };

        let mut guest = PathBuf::from("/");
        for part in parts {
            let cleaned: String = part
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(16)
                .collect();
            if !cleaned.is_empty() {
                guest.push(cleaned);
            }
        }
        if guest.as_os_str().len() >= 1024 {
            return true;
        }

        match view.translate(&guest, Follow::Final) {
            Ok(translated) => view.detranslate(&translated.host) == normalize(&guest),
            Err(_) => false,
        }
    }

    #[quickcheck]
    fn prop_longest_prefix_selected(depth: u8) -> bool {
        // Nested bindings: deeper prefixes always win, whatever the order of
        // insertion.
        let depth = (depth % 6) as usize;
        let mut table = BindingTable::new("/sandbox");
        let mut guest = PathBuf::from("/");
        for i in 0..=depth {
            guest.push(format!("d{}", i));
            table.insert(Binding::new_dir(&guest, format!("/host{}", i)));
        }

        let probe = guest.join("leaf");
        let selected = table.find_guest(&probe);
        selected.guest_prefix() == guest.as_path()
    }
}
