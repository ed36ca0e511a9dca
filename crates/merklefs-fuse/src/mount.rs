//! Mount options and session setup.

use std::io;
use std::path::Path;
use std::time::Duration;

use fuser::MountOption;
use tracing::info;

use crate::vfs::MerkleFs;

/// Attribute and entry timeout handed to the kernel when caching is on.
///
/// The tree is immutable for the lifetime of the mount, so the kernel may
/// cache aggressively; one day keeps revalidation traffic negligible.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(86400);

/// Knobs of one mount.
#[derive(Debug, Clone)]
pub struct MountOpts {
    /// Attribute/entry timeout; zero disables all caching.
    pub timeout: Duration,
    /// Do not negotiate splice support with the kernel.
    pub nosplice: bool,
    /// Owner reported for every inode.
    pub uid: u32,
    /// Group reported for every inode.
    pub gid: u32,
}

impl MountOpts {
    /// Whether kernel-side caching is in effect.
    pub fn cache(&self) -> bool {
        !self.timeout.is_zero()
    }
}

impl Default for MountOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            nosplice: false,
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Builds the option list passed to the kernel layer.
///
/// Modes are served exactly as the metadata records them and the kernel
/// enforces them (`default_permissions`); the tree itself is read-only.
pub fn mount_options(extra: &[String]) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("merklefs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    options.extend(extra.iter().cloned().map(MountOption::CUSTOM));
    options
}

/// Mounts `fs` at `mountpoint` and serves kernel requests until unmount.
pub fn mount(fs: MerkleFs, mountpoint: &Path, extra: &[String]) -> io::Result<()> {
    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(fs, mountpoint, &mount_options(extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_follows_timeout() {
        let mut opts = MountOpts::default();
        assert!(opts.cache());
        opts.timeout = Duration::ZERO;
        assert!(!opts.cache());
    }

    #[test]
    fn test_extra_options_pass_through() {
        let options = mount_options(&["allow_other".to_owned()]);
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::CUSTOM("allow_other".to_owned())));
    }
}
