//! Free-space checks before a transcode starts.

use std::path::Path;
use sysinfo::Disks;
use tracing::warn;

/// Output needs this multiple of the input size in free space.
pub const REQUIRED_SPACE_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Total/free bytes of the filesystem holding a path.
pub trait DiskUsage: Send + Sync {
    fn usage(&self, path: &Path) -> Option<DiskSpace>;
}

/// Answers from the mounted filesystems `sysinfo` reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskUsage;

impl DiskUsage for SystemDiskUsage {
    fn usage(&self, path: &Path) -> Option<DiskSpace> {
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks.list().iter().map(|disk| {
            (
                disk.mount_point(),
                DiskSpace {
                    total_bytes: disk.total_space(),
                    free_bytes: disk.available_space(),
                },
            )
        });
        longest_mount_match(path, mounts)
    }
}

/// Picks the mount point that is the longest prefix of `path`.
pub fn longest_mount_match<'a>(
    path: &Path,
    mounts: impl IntoIterator<Item = (&'a Path, DiskSpace)>,
) -> Option<DiskSpace> {
    mounts
        .into_iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|(_, space)| space)
}

/// Whether `dir` has room for an output derived from `input_size` bytes.
///
/// Unknown usage allows the job; the transcode itself surfaces a full disk.
pub fn has_space_for(disk: &dyn DiskUsage, dir: &Path, input_size: u64) -> bool {
    let probe_path = dir
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(dir);
    let Some(space) = disk.usage(probe_path) else {
        warn!(path = %dir.display(), "disk usage unavailable, skipping space check");
        return true;
    };
    space.free_bytes >= input_size.saturating_mul(REQUIRED_SPACE_FACTOR)
}
