use anyhow::{self, Context};
use nix::{
    mount::{MntFlags, MsFlags, mount, umount2},
    unistd::{chdir, pivot_root},
};
use std::{
    fs::{File, create_dir_all, remove_dir},
    os::unix::fs::symlink,
    path::Path,
};

/// Device nodes bind-mounted from the host into the container's `/dev`.
const DEV_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

const DEV_LINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "fd"),
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
];

/// Switch the calling process's root to `rootfs`.
///
/// Must run inside a fresh mount namespace. On return the old root is
/// detached, `/dev` holds a minimal set of device nodes and `/proc` reflects
/// the current pid namespace.
pub(crate) fn enter_rootfs(rootfs: &Path) -> anyhow::Result<()> {
    // change the root fs propagation to private
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("private propagation for /")?;

    // pivot_root requires the new root to be a mount point
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("bind mount {:?}", rootfs))?;

    mount_dev(rootfs).context("populate /dev")?;

    let old_root = rootfs.join(".old_root");
    create_dir_all(&old_root).context("create old_root")?;

    // pivot_root and unmount old_root
    pivot_root(rootfs, &old_root).context("pivot_root")?;
    chdir("/").context("chdir to /")?;
    umount2("/.old_root", MntFlags::MNT_DETACH).context("umount old_root")?;
    let _ = remove_dir("/.old_root");

    mount_proc()
}

fn mount_dev(rootfs: &Path) -> anyhow::Result<()> {
    let dev = rootfs.join("dev");
    create_dir_all(&dev).with_context(|| format!("create {:?}", dev))?;
    mount(
        Some("tmpfs"),
        &dev,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755,size=65536k"),
    )
    .context("mount tmpfs on /dev")?;

    for node in DEV_NODES {
        let host = Path::new("/dev").join(node);
        if !host.exists() {
            continue;
        }
        let target = dev.join(node);
        File::create(&target).with_context(|| format!("create {:?}", target))?;
        mount(
            Some(&host),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| format!("bind mount {:?}", host))?;
    }

    for (source, name) in DEV_LINKS {
        let link = dev.join(name);
        symlink(source, &link).with_context(|| format!("symlink {:?}", link))?;
    }
    Ok(())
}

fn mount_proc() -> anyhow::Result<()> {
    create_dir_all("/proc").context("create /proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mount /proc")?;
    Ok(())
}
