//! Shared test utilities for autochroot integration tests.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use autochroot::config::Config;
use autochroot::inventory::StaticInventory;

/// Test environment with a temporary fstab and output location.
pub struct TestEnv {
    /// Kept alive for the lifetime of the environment.
    pub _temp_dir: TempDir,
    pub fstab_path: PathBuf,
    pub output_path: PathBuf,
    pub config: Config,
}

impl TestEnv {
    /// Create an environment whose config points all paths into a temp dir.
    pub fn new(fstab: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let fstab_path = temp_dir.path().join("fstab");
        let output_path = temp_dir.path().join("perform-chroot.sh");
        fs::write(&fstab_path, fstab).expect("failed to write fstab");

        let mut config = Config::default();
        config.general.fstab_path = fstab_path.clone();
        config.general.output_path = output_path.clone();
        config.general.log_file = temp_dir.path().join("autochroot.log");

        Self {
            _temp_dir: temp_dir,
            fstab_path,
            output_path,
            config,
        }
    }

    pub fn written_script(&self) -> String {
        fs::read_to_string(&self.output_path).expect("script should have been written")
    }

    /// Files in the temp dir ending in `.bak`, for backup assertions.
    pub fn backup_files(&self) -> Vec<PathBuf> {
        let mut backups: Vec<PathBuf> = fs::read_dir(self._temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".bak"))
            .collect();
        backups.sort();
        backups
    }
}

/// Inventory with one ext4 root and one ext4 boot partition.
pub fn ext4_inventory() -> StaticInventory {
    let mut inventory = StaticInventory::new();
    inventory.add_partition("/dev/sda2", "root-uuid", "ext4");
    inventory.add_partition("/dev/sda1", "boot-uuid", "ext4");
    inventory
}

/// Inventory with a single btrfs partition shared by several subvolumes.
pub fn btrfs_inventory() -> StaticInventory {
    let mut inventory = StaticInventory::new();
    inventory.add_partition("/dev/sda2", "btrfs-uuid", "btrfs");
    inventory
}

/// Inventory with one LUKS container.
pub fn luks_inventory() -> StaticInventory {
    let mut inventory = StaticInventory::new();
    inventory.add_luks_container("/dev/sda2", "crypt-uuid");
    inventory
}
