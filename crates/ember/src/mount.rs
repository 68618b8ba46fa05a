//! Host-side mount plumbing: defensive parsing of the kernel mount tables
//! and thin wrappers over the mount, umount, mkfs, lsblk and resize
//! utilities, with the bounded retries slow hosts need.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::MountError;

/// Exit code `umount`/`mount` return when the target is busy; the default
/// retryable set.
pub const RETRYABLE_EXIT_CODES: &[i32] = &[32];

/// One row of `/proc/self/mountinfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfoEntry {
    /// Root of the mount within its filesystem.
    pub root: String,
    pub mount_point: String,
    pub fs_type: String,
    /// Mount source; a device path for real filesystems, arbitrary text
    /// for virtual ones.
    pub source: String,
}

/// One row of `/proc/self/mounts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parses `/proc/self/mountinfo` content. Rows that are too short to carry
/// the fixed fields collapse to empty sentinels instead of being dropped,
/// and the optional-fields block is skipped up to its `-` terminator.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let root = fields.get(3).copied().unwrap_or_default();
            let mount_point = fields.get(4).copied().unwrap_or_default();
            // fields[6..] holds zero or more optional fields terminated by
            // a lone dash, then fstype and source.
            let after_separator = fields
                .iter()
                .position(|f| *f == "-")
                .map(|i| &fields[i + 1..])
                .unwrap_or(&[]);
            MountInfoEntry {
                root: unescape_mount_field(root),
                mount_point: unescape_mount_field(mount_point),
                fs_type: after_separator.first().copied().unwrap_or_default().to_owned(),
                source: unescape_mount_field(after_separator.get(1).copied().unwrap_or_default()),
            }
        })
        .collect()
}

/// Parses `/proc/self/mounts` content.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            MountEntry {
                source: unescape_mount_field(fields.first().copied().unwrap_or_default()),
                target: unescape_mount_field(fields.get(1).copied().unwrap_or_default()),
                fs_type: fields.get(2).copied().unwrap_or_default().to_owned(),
                options: fields
                    .get(3)
                    .map(|opts| opts.split(',').map(|o| o.to_owned()).collect())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

// The kernel escapes spaces, tabs, newlines and backslashes in mount table
// paths as octal sequences.
fn unescape_mount_field(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let octal: String = chars.clone().take(3).collect();
            if octal.len() == 3 && octal.chars().all(|d| ('0'..='7').contains(&d)) {
                if let Ok(value) = u8::from_str_radix(&octal, 8) {
                    result.push(value as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        result.push(c);
    }
    result
}

pub async fn read_mountinfo() -> Result<Vec<MountInfoEntry>, MountError> {
    let content = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
    Ok(parse_mountinfo(&content))
}

pub async fn read_mounts() -> Result<Vec<MountEntry>, MountError> {
    let content = tokio::fs::read_to_string("/proc/self/mounts").await?;
    Ok(parse_mounts(&content))
}

/// The device a path is a mount of, if any: the mount source when it is a
/// real path, the in-filesystem root otherwise (bind mounts).
pub fn device_for_path<'a>(mountinfo: &'a [MountInfoEntry], path: &str) -> Option<&'a str> {
    mountinfo.iter().find(|e| e.mount_point == path).map(|e| {
        if e.source.starts_with('/') {
            e.source.as_str()
        } else {
            e.root.as_str()
        }
    })
}

/// Mount-table rows whose source is the given path. Used to find what the
/// private bind is mounted on.
pub fn mounts_for_source<'a>(mounts: &'a [MountEntry], source: &str) -> Vec<&'a MountEntry> {
    mounts.iter().filter(|m| m.source == source).collect()
}

/// How many mounts still reference the volume: mountinfo rows rooted at
/// the device or private bind, plus mounts whose source is the private
/// bind. Two is the idle staged state (private bind + staging mount).
pub fn count_volume_mounts(
    mountinfo: &[MountInfoEntry],
    mounts: &[MountEntry],
    device: &str,
    private_bind: &str,
) -> usize {
    let rooted = mountinfo
        .iter()
        .filter(|e| e.root == device || e.root == private_bind)
        .count();
    rooted + mounts_for_source(mounts, private_bind).len()
}

/// Output of a host command, both streams decoded.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a host command, retrying on the given exit codes with exponential
/// backoff. `retries` counts attempts, so 1 means no retry at all.
pub async fn sudo(
    program: &str,
    args: &[&str],
    retries: u32,
    delay: Duration,
    retryable: &[i32],
) -> Result<CommandOutput, MountError> {
    let mut delay = delay;
    let mut attempts = retries.max(1);
    loop {
        debug!(command = program, ?args, "running host command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| MountError::Spawn {
                command: program.to_owned(),
                source,
            })?;

        if output.status.success() {
            return Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        attempts -= 1;
        if attempts == 0 || !retryable.contains(&code) {
            return Err(MountError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                code,
                stderr,
            });
        }
        warn!(command = program, code, "host command failed, retrying");
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}

async fn run(program: &str, args: &[&str]) -> Result<CommandOutput, MountError> {
    sudo(program, args, 1, Duration::from_secs(1), RETRYABLE_EXIT_CODES).await
}

/// The filesystem already on a device, if any. lsblk needs a few retries
/// on freshly attached devices.
pub async fn existing_filesystem(device: &str) -> Result<Option<String>, MountError> {
    let output = sudo(
        "lsblk",
        &["-nlf", "-o", "FSTYPE", device],
        5,
        Duration::from_secs(2),
        &[1, 32],
    )
    .await?;
    Ok(output
        .stdout
        .split_whitespace()
        .next()
        .map(|fs| fs.to_owned()))
}

/// Formats a device. Extra arguments come from the per-filesystem table
/// (ext4 wants `-F` to skip the interactive prompt).
pub async fn mkfs(fs_type: &str, device: &str, extra_args: &[&str]) -> Result<(), MountError> {
    let program = format!("mkfs.{}", fs_type);
    let mut args: Vec<&str> = extra_args.to_vec();
    args.push(device);
    run(&program, &args).await.map(|_| ())
}

pub async fn mount(
    fs_type: &str,
    mount_flags: &[String],
    source: &str,
    target: &str,
) -> Result<(), MountError> {
    let mut args = vec!["-t", fs_type];
    let joined;
    if !mount_flags.is_empty() {
        joined = mount_flags.join(",");
        args.push("-o");
        args.push(&joined);
    }
    args.push(source);
    args.push(target);
    run("mount", &args).await.map(|_| ())
}

pub async fn bind_mount(source: &str, target: &str, read_only: bool) -> Result<(), MountError> {
    let options = if read_only { "bind,ro" } else { "bind" };
    run("mount", &["-o", options, source, target]).await.map(|_| ())
}

/// Unmounts a target, retrying on the busy exit code.
pub async fn unmount(target: &str, retries: u32) -> Result<(), MountError> {
    sudo(
        "umount",
        &[target],
        retries,
        Duration::from_secs(1),
        RETRYABLE_EXIT_CODES,
    )
    .await
    .map(|_| ())
}

/// Flushes outstanding writes for a device before it is unmounted away.
pub async fn sync_device(device: &str) -> Result<(), MountError> {
    run("sync", &[device]).await.map(|_| ())
}

/// Filesystem usage of a mounted path, in bytes: (total, used, available).
pub fn fs_usage(path: &Path) -> Result<(i64, i64, i64), MountError> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|e| MountError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let frsize = stats.fragment_size() as i64;
    let total = frsize * stats.blocks() as i64;
    let available = frsize * stats.blocks_available() as i64;
    Ok((total, total - available, available))
}

/// Size of a block device in bytes, from its 512-byte sector count in
/// sysfs.
pub async fn block_device_size(device: &str) -> Result<i64, MountError> {
    let name = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sysfs = format!("/sys/class/block/{}/size", name);
    let content = tokio::fs::read_to_string(&sysfs).await?;
    let blocks: i64 = content.trim().parse().map_err(|_| {
        MountError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unparsable sector count in {}", sysfs),
        ))
    })?;
    Ok(blocks * 512)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 27 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
27 0 253:0 / / rw,relatime shared:1 - xfs /dev/mapper/root rw,attr2
618 27 7:1 / /var/lib/ember-csi/vols/uuid-1 rw,relatime shared:310 - ext4 /dev/loop1 rw
619 27 7:1 / /var/lib/kubelet/stage/vol/stage rw,relatime shared:311 master:310 - ext4 /dev/loop1 rw
620 27 0:25 /vols/uuid-2 /var/lib/kubelet/pods/pod-1/volume rw shared:312 - xfs /dev/sdb rw
broken-short-line
";

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/mapper/root / xfs rw,relatime,attr2 0 0
/var/lib/ember-csi/vols/uuid-1 /var/lib/kubelet/stage/vol/stage ext4 rw,relatime 0 0
";

    #[test]
    fn mountinfo_parses_fixed_fields() {
        let entries = parse_mountinfo(MOUNTINFO);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].mount_point, "/proc");
        assert_eq!(entries[0].fs_type, "proc");
        assert_eq!(entries[1].source, "/dev/mapper/root");
    }

    #[test]
    fn mountinfo_handles_multiple_optional_fields() {
        let entries = parse_mountinfo(MOUNTINFO);
        // Row with shared + master optional fields still finds fstype.
        assert_eq!(entries[3].fs_type, "ext4");
        assert_eq!(entries[3].source, "/dev/loop1");
    }

    #[test]
    fn short_lines_collapse_to_empty_sentinels() {
        let entries = parse_mountinfo(MOUNTINFO);
        let broken = &entries[5];
        assert_eq!(broken.mount_point, "");
        assert_eq!(broken.fs_type, "");
        assert_eq!(broken.source, "");
    }

    #[test]
    fn device_lookup_prefers_absolute_source() {
        let entries = parse_mountinfo(MOUNTINFO);
        assert_eq!(
            device_for_path(&entries, "/var/lib/kubelet/stage/vol/stage"),
            Some("/dev/loop1")
        );
        assert_eq!(device_for_path(&entries, "/nope"), None);
    }

    #[test]
    fn device_lookup_falls_back_to_root_for_binds() {
        // A bind mount of a directory reports the path inside the source
        // filesystem as root; sources like /dev/sdb are still absolute, so
        // craft a virtual source.
        let entries = parse_mountinfo(
            "700 27 0:25 /vols/uuid-3 /target rw shared:313 - overlay overlay rw\n",
        );
        assert_eq!(device_for_path(&entries, "/target"), Some("/vols/uuid-3"));
    }

    #[test]
    fn mounts_filter_by_source() {
        let mounts = parse_mounts(MOUNTS);
        let found = mounts_for_source(&mounts, "/var/lib/ember-csi/vols/uuid-1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target, "/var/lib/kubelet/stage/vol/stage");
        assert!(found[0].options.iter().any(|o| o == "rw"));
    }

    #[test]
    fn volume_mount_count_covers_binds_and_sources() {
        let mountinfo = parse_mountinfo(
            "\
618 27 7:1 /dev/loop1 /var/lib/ember-csi/vols/uuid-1 rw - ext4 /dev/loop1 rw
619 27 7:1 /var/lib/ember-csi/vols/uuid-1 /stage rw - ext4 /dev/loop1 rw
",
        );
        let mounts = parse_mounts(MOUNTS);
        let count = count_volume_mounts(
            &mountinfo,
            &mounts,
            "/dev/loop1",
            "/var/lib/ember-csi/vols/uuid-1",
        );
        assert_eq!(count, 3);
    }

    #[test]
    fn octal_escapes_are_decoded() {
        assert_eq!(unescape_mount_field("/with\\040space"), "/with space");
        assert_eq!(unescape_mount_field("/plain"), "/plain");
        assert_eq!(unescape_mount_field("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn fs_usage_reports_nonzero_total() {
        let (total, used, available) = fs_usage(Path::new("/")).unwrap();
        assert!(total > 0);
        assert!(used >= 0);
        assert!(available >= 0);
    }
}
