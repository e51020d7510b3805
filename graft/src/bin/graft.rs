/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The graft command line: `graft -r ./rootfs /bin/sh`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use graft::Config;
use tracing_subscriber::EnvFilter;

/// Parses a `HOST:GUEST` bind specification; a bare path binds it at the same
/// location in the guest.
fn parse_bind(s: &str) -> anyhow::Result<(String, String)> {
    match s.split_once(':') {
        Some((host, guest)) => Ok((host.to_owned(), guest.to_owned())),
        None => Ok((s.to_owned(), s.to_owned())),
    }
}

/// Parses a `PORT_IN:PORT_OUT` port map entry.
fn parse_port(s: &str) -> anyhow::Result<(u16, u16)> {
    let (from, to) = s
        .split_once(':')
        .context("expected PORT_IN:PORT_OUT")?;
    Ok((from.parse()?, to.parse()?))
}

/// Parses a `UID:GID` pair.
fn parse_ids(s: &str) -> anyhow::Result<(u32, u32)> {
    let (uid, gid) = s.split_once(':').context("expected UID:GID")?;
    Ok((uid.parse()?, gid.parse()?))
}

/// Parses a `KEY=VALUE` environment entry; a bare key copies the host value.
fn parse_env(s: &str) -> anyhow::Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) => Ok((key.to_owned(), value.to_owned())),
        None => {
            let value = std::env::var(s)?;
            Ok((s.to_owned(), value))
        }
    }
}

/// chroot, mount --bind, and binfmt_misc without privilege/setup.
#[derive(Debug, Parser)]
#[command(name = "graft", version)]
struct Args {
    /// Use this directory as the guest root file system.
    #[arg(short = 'r', long = "rootfs", value_name = "PATH", default_value = "/")]
    rootfs: PathBuf,

    /// Make the content of HOST accessible at GUEST in the guest rootfs.
    #[arg(short = 'b', long = "bind", value_name = "HOST[:GUEST]", value_parser = parse_bind)]
    binds: Vec<(String, String)>,

    /// Make the rootfs read-only for the guest.
    #[arg(long = "read-only")]
    read_only: bool,

    /// Do not pre-bind /dev, /proc, /sys and the name-service files.
    #[arg(long = "no-default-binds")]
    no_default_binds: bool,

    /// Execute foreign-architecture guest programs through this emulator.
    #[arg(short = 'q', long = "qemu", value_name = "COMMAND")]
    qemu: Option<String>,

    /// Make the current kernel appear as this release.
    #[arg(short = 'k', long = "kernel-release", value_name = "RELEASE")]
    kernel_release: Option<String>,

    /// Make the current user and group appear as UID:GID.
    #[arg(short = 'i', long = "ids", value_name = "UID:GID", value_parser = parse_ids)]
    ids: Option<(u32, u32)>,

    /// Map a guest port to another host port in bind/connect.
    #[arg(short = 'p', long = "port", value_name = "IN:OUT", value_parser = parse_port)]
    ports: Vec<(u16, u16)>,

    /// Set the initial working directory (guest view).
    #[arg(short = 'w', long = "cwd", value_name = "PATH", default_value = "/")]
    cwd: PathBuf,

    /// Set an environment variable for the guest. Can be repeated.
    #[arg(short = 'e', long = "env", value_name = "KEY[=VALUE]", value_parser = parse_env)]
    envs: Vec<(String, String)>,

    /// Direct logging to stderr per RUST_LOG.
    #[arg(long = "verbose", short = 'v')]
    verbose: bool,

    /// Guest program to run.
    #[arg(value_name = "PROGRAM")]
    program: String,

    /// Arguments to the guest program.
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    program_args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("graft=debug"))
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::new(&args.rootfs)
        .current_dir(&args.cwd)
        .arg(&args.program);
    for arg in &args.program_args {
        config = config.arg(arg);
    }

    for (host, guest) in args.binds {
        config = config.bind(host, guest);
    }
    if args.read_only {
        config = config.rootfs_read_only();
    }
    if args.no_default_binds {
        config = config.no_default_binds();
    }
    if let Some(qemu) = args.qemu {
        config = config.qemu(qemu.split_whitespace().map(str::to_owned));
    }
    if let Some(release) = args.kernel_release {
        config = config.kernel_release(release);
    }
    if let Some((uid, gid)) = args.ids {
        config = config.ids(uid as libc::uid_t, gid as libc::gid_t);
    }
    for (from, to) in args.ports {
        config = config.map_port(from, to);
    }
    for (key, value) in args.envs {
        config = config.env(key, value);
    }

    let guest = graft::spawn(config).context("failed to start the guest")?;
    let status = guest.wait().context("guest failed")?;

    status.propagate()
}
