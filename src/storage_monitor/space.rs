//! Free-space probing for the capture volume

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::Path;
use sysinfo::Disks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskSpace {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

pub trait SpaceProbe: Send + Sync {
    /// Space on the volume holding `path`
    fn space(&self, path: &Path) -> Result<DiskSpace>;
}

/// sysinfo-backed probe: picks the disk with the longest mount point containing `path`
pub struct SysinfoSpaceProbe;

impl SpaceProbe for SysinfoSpaceProbe {
    fn space(&self, path: &Path) -> Result<DiskSpace> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskSpace {
                total_bytes: disk.total_space(),
                free_bytes: disk.available_space(),
            })
            .ok_or_else(|| Error::NotFound(format!("no disk found for {}", target.display())))
    }
}
