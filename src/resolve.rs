//! Volume resolution: from fstab records to concrete, mountable objects.
//!
//! Each [`MountRecord`] is classified as a plain block device, a LUKS
//! container that needs an unlock step, or a btrfs subvolume. Resolution is a
//! pure function of the record, the configuration and the injected
//! [`DeviceInventory`]; the one hard rule is that no mount instruction is
//! ever produced for a target the inventory cannot confirm.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::error::ResolutionError;
use crate::fstab::{DeviceSpec, MountRecord};
use crate::inventory::{BlockDevice, DeviceInventory};

/// Filesystem types the engine refuses to plan (networked or otherwise not
/// reproducible from local configuration).
const UNSUPPORTED_FSTYPES: &[&str] = &["nfs", "nfs4", "cifs", "smbfs", "sshfs", "fuse.sshfs"];

/// Classification of a resolved mount record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    Plain,
    /// LUKS container; the mount source is `/dev/mapper/<alias>`.
    Encrypted { alias: String },
    /// Named subvolume of a btrfs filesystem.
    Subvolume { name: String },
}

/// A mount record bound to a concrete storage object.
#[derive(Debug, Clone)]
pub struct ResolvedVolume {
    pub record: MountRecord,
    pub kind: VolumeKind,
    /// The underlying block device: the LUKS container for Encrypted volumes,
    /// the filesystem partition otherwise.
    pub backing: PathBuf,
    /// Final mount options, including any auto-detected subvolume selector.
    pub options: Vec<String>,
}

impl ResolvedVolume {
    /// Device path used in the generated mount command.
    pub fn mount_source(&self) -> PathBuf {
        match &self.kind {
            VolumeKind::Encrypted { alias } => PathBuf::from(format!("/dev/mapper/{}", alias)),
            _ => self.backing.clone(),
        }
    }

    pub fn unlock_alias(&self) -> Option<&str> {
        match &self.kind {
            VolumeKind::Encrypted { alias } => Some(alias),
            _ => None,
        }
    }

    pub fn mount_point(&self) -> &str {
        &self.record.mount_point
    }
}

/// Resolves mount records against a device inventory.
pub struct VolumeResolver<'a> {
    config: &'a Config,
    inventory: &'a dyn DeviceInventory,
}

impl<'a> VolumeResolver<'a> {
    pub fn new(config: &'a Config, inventory: &'a dyn DeviceInventory) -> Self {
        Self { config, inventory }
    }

    /// Resolve one record. Pure apart from inventory lookups.
    pub fn resolve(&self, record: &MountRecord) -> Result<ResolvedVolume, ResolutionError> {
        if UNSUPPORTED_FSTYPES.contains(&record.fs_type.as_str()) {
            return Err(ResolutionError::UnsupportedFilesystem {
                fstype: record.fs_type.clone(),
                mount_point: record.mount_point.clone(),
            });
        }

        let device = self.lookup(record)?;
        let resolved = self.classify(record, device)?;
        self.verify(&resolved)?;

        debug!(
            mount_point = %resolved.record.mount_point,
            backing = %resolved.backing.display(),
            kind = ?resolved.kind,
            "resolved volume"
        );
        Ok(resolved)
    }

    /// Map the record's specifier to an inventory device.
    fn lookup(&self, record: &MountRecord) -> Result<BlockDevice, ResolutionError> {
        match self.inventory.find(&record.spec) {
            Ok(device) => Ok(device),
            // A literal /dev path the inventory has never seen can still be
            // used when the administrator disabled device verification.
            Err(ResolutionError::DeviceNotFound { .. }) => match &record.spec {
                DeviceSpec::Path(path) if !self.config.safety.verify_devices => {
                    Ok(BlockDevice {
                        path: PathBuf::from(path),
                        ..Default::default()
                    })
                }
                _ => Err(ResolutionError::DeviceNotFound {
                    spec: record.spec.to_string(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    fn classify(
        &self,
        record: &MountRecord,
        device: BlockDevice,
    ) -> Result<ResolvedVolume, ResolutionError> {
        // A raw LUKS container: the script must open it before mounting.
        if device.is_luks_container() {
            let alias = self.derive_alias(&device);
            return Ok(ResolvedVolume {
                record: record.clone(),
                kind: VolumeKind::Encrypted { alias },
                backing: device.path,
                options: record.options.clone(),
            });
        }

        // An already-open mapping referenced as /dev/mapper/<name>: keep the
        // name the system uses and unlock its container.
        if device.devtype.as_deref() == Some("crypt") {
            let alias = mapper_name(&device.path).to_string();
            let backing = match &device.parent {
                Some(parent) => parent.clone(),
                // Without the container we cannot emit an unlock step that
                // could ever succeed on a rescue system.
                None => {
                    return Err(ResolutionError::DeviceNotFound {
                        spec: format!("{} (LUKS container)", device.path.display()),
                    })
                }
            };
            return Ok(ResolvedVolume {
                record: record.clone(),
                kind: VolumeKind::Encrypted { alias },
                backing,
                options: record.options.clone(),
            });
        }

        if record.fs_type == "btrfs" {
            if let Some(name) = record.subvol_option() {
                return Ok(ResolvedVolume {
                    record: record.clone(),
                    kind: VolumeKind::Subvolume {
                        name: name.to_string(),
                    },
                    backing: device.path,
                    options: record.options.clone(),
                });
            }
            // Selection by numeric id instead of path.
            if let Some(id) = record
                .options
                .iter()
                .find_map(|o| o.strip_prefix("subvolid="))
            {
                return Ok(ResolvedVolume {
                    record: record.clone(),
                    kind: VolumeKind::Subvolume {
                        name: id.to_string(),
                    },
                    backing: device.path,
                    options: record.options.clone(),
                });
            }
            // No subvol option in the table: config decides between mounting
            // the default subvolume and treating the entry as plain.
            if self.config.btrfs.auto_detect {
                let extra: Vec<String> = self
                    .config
                    .btrfs
                    .default_options
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                let mut options = record.options.clone();
                options.extend(extra.iter().cloned());
                let name = extra
                    .iter()
                    .find_map(|o| o.strip_prefix("subvol="))
                    .unwrap_or("@")
                    .to_string();
                return Ok(ResolvedVolume {
                    record: record.clone(),
                    kind: VolumeKind::Subvolume { name },
                    backing: device.path,
                    options,
                });
            }
        }

        Ok(ResolvedVolume {
            record: record.clone(),
            kind: VolumeKind::Plain,
            backing: device.path,
            options: record.options.clone(),
        })
    }

    /// Deterministic mapper alias: configured prefix plus the container's
    /// UUID, so repeated runs generate identical scripts.
    fn derive_alias(&self, device: &BlockDevice) -> String {
        let suffix = device
            .uuid
            .clone()
            .unwrap_or_else(|| mapper_name(&device.path).to_string());
        format!("{}{}", self.config.luks.alias_prefix, suffix)
    }

    /// Existence check. Mapper paths of not-yet-unlocked volumes are exempt;
    /// their container is what must exist.
    fn verify(&self, resolved: &ResolvedVolume) -> Result<(), ResolutionError> {
        if !self.config.safety.verify_devices {
            return Ok(());
        }
        if !self.inventory.exists(&resolved.backing) {
            return Err(ResolutionError::DeviceNotFound {
                spec: resolved.backing.display().to_string(),
            });
        }
        Ok(())
    }
}

fn mapper_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fstab::parse_fstab;
    use crate::inventory::{StaticInventory, LUKS_FSTYPE};

    fn record(line: &str) -> MountRecord {
        let config = Config::default();
        parse_fstab(line, &config.mount, false)
            .unwrap()
            .records
            .remove(0)
    }

    #[test]
    fn test_plain_ext4_by_uuid() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "1234-ABCD", "ext4");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=1234-ABCD / ext4 defaults 0 1\n"))
            .unwrap();

        assert_eq!(volume.kind, VolumeKind::Plain);
        assert_eq!(volume.backing, PathBuf::from("/dev/sda1"));
        assert_eq!(volume.mount_source(), PathBuf::from("/dev/sda1"));
    }

    #[test]
    fn test_luks_container_gets_deterministic_alias() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_luks_container("/dev/sda2", "abcd-1234");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=abcd-1234 / ext4 noatime 0 1\n"))
            .unwrap();

        assert_eq!(
            volume.kind,
            VolumeKind::Encrypted {
                alias: "luks-abcd-1234".into()
            }
        );
        assert_eq!(volume.backing, PathBuf::from("/dev/sda2"));
        assert_eq!(
            volume.mount_source(),
            PathBuf::from("/dev/mapper/luks-abcd-1234")
        );

        // Idempotence: same inputs, same alias.
        let again = resolver
            .resolve(&record("UUID=abcd-1234 / ext4 noatime 0 1\n"))
            .unwrap();
        assert_eq!(volume.unlock_alias(), again.unlock_alias());
    }

    #[test]
    fn test_alias_prefix_from_config() {
        let mut config = Config::default();
        config.luks.alias_prefix = "crypt-".into();
        let mut inventory = StaticInventory::new();
        inventory.add_luks_container("/dev/sda2", "abcd-1234");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=abcd-1234 / ext4 defaults 0 1\n"))
            .unwrap();
        assert_eq!(volume.unlock_alias(), Some("crypt-abcd-1234"));
    }

    #[test]
    fn test_mapper_path_resolves_to_container() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_luks_container("/dev/sda2", "abcd-1234");
        inventory.add(BlockDevice {
            path: PathBuf::from("/dev/mapper/cryptroot"),
            fstype: Some("ext4".into()),
            devtype: Some("crypt".into()),
            parent: Some(PathBuf::from("/dev/sda2")),
            ..Default::default()
        });

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("/dev/mapper/cryptroot / ext4 defaults 0 1\n"))
            .unwrap();

        // Keeps the system's mapper name instead of inventing a new one.
        assert_eq!(volume.unlock_alias(), Some("cryptroot"));
        assert_eq!(volume.backing, PathBuf::from("/dev/sda2"));
    }

    #[test]
    fn test_btrfs_subvolume_extraction() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda3", "bt-uuid", "btrfs");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=bt-uuid /home btrfs subvol=@home,compress=zstd 0 2\n"))
            .unwrap();

        assert_eq!(
            volume.kind,
            VolumeKind::Subvolume {
                name: "@home".into()
            }
        );
        assert!(volume.options.contains(&"subvol=@home".to_string()));
    }

    #[test]
    fn test_btrfs_subvolid_selector() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda3", "bt-uuid", "btrfs");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=bt-uuid /snap btrfs subvolid=256 0 2\n"))
            .unwrap();
        assert_eq!(volume.kind, VolumeKind::Subvolume { name: "256".into() });
        assert!(volume.options.contains(&"subvolid=256".to_string()));
    }

    #[test]
    fn test_btrfs_without_subvol_is_plain_by_default() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda3", "bt-uuid", "btrfs");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=bt-uuid / btrfs compress=zstd 0 1\n"))
            .unwrap();
        assert_eq!(volume.kind, VolumeKind::Plain);
    }

    #[test]
    fn test_btrfs_auto_detect_appends_default_subvol() {
        let mut config = Config::default();
        config.btrfs.auto_detect = true;
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda3", "bt-uuid", "btrfs");

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("UUID=bt-uuid / btrfs compress=zstd 0 1\n"))
            .unwrap();
        assert_eq!(volume.kind, VolumeKind::Subvolume { name: "@".into() });
        assert!(volume.options.contains(&"subvol=@".to_string()));
        assert!(volume.options.contains(&"compress=zstd".to_string()));
    }

    #[test]
    fn test_unknown_device_fails_explicitly() {
        let config = Config::default();
        let inventory = StaticInventory::new();

        let resolver = VolumeResolver::new(&config, &inventory);
        let err = resolver
            .resolve(&record("UUID=no-such / ext4 defaults 0 1\n"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_network_filesystem_unsupported() {
        let config = Config::default();
        let inventory = StaticInventory::new();

        let resolver = VolumeResolver::new(&config, &inventory);
        let err = resolver
            .resolve(&record("/dev/nas0 /data nfs defaults 0 0\n"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnsupportedFilesystem { .. }));
    }

    #[test]
    fn test_unverified_path_allowed_when_verification_off() {
        let mut config = Config::default();
        config.safety.verify_devices = false;
        let inventory = StaticInventory::new();

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("/dev/sdz9 /data ext4 defaults 0 2\n"))
            .unwrap();
        assert_eq!(volume.backing, PathBuf::from("/dev/sdz9"));
    }

    #[test]
    fn test_luks_container_without_uuid_uses_device_name() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add(BlockDevice {
            path: PathBuf::from("/dev/sdb1"),
            fstype: Some(LUKS_FSTYPE.into()),
            devtype: Some("part".into()),
            ..Default::default()
        });

        let resolver = VolumeResolver::new(&config, &inventory);
        let volume = resolver
            .resolve(&record("/dev/sdb1 /secret ext4 defaults 0 2\n"))
            .unwrap();
        assert_eq!(volume.unlock_alias(), Some("luks-sdb1"));
    }
}
