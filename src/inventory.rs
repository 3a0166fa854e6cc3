//! Device inventory: the engine's view of the host's block devices.
//!
//! Resolution never guesses. Everything the resolver knows about devices
//! comes through the [`DeviceInventory`] trait, so the whole pipeline can be
//! exercised against a [`StaticInventory`] without touching real hardware.
//!
//! [`SystemInventory`] takes one `lsblk -J` snapshot at construction time and
//! answers every lookup from it. The snapshot command is bounded by the
//! configured lookup timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::ResolutionError;
use crate::fstab::DeviceSpec;
use crate::process::{Cmd, CommandTimeout};

/// lsblk fstype value marking a LUKS container.
pub const LUKS_FSTYPE: &str = "crypto_LUKS";

/// One block device as the inventory sees it.
#[derive(Debug, Clone, Default)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub partuuid: Option<String>,
    pub partlabel: Option<String>,
    pub fstype: Option<String>,
    /// lsblk TYPE: disk, part, crypt, lvm, raid…
    pub devtype: Option<String>,
    /// Parent in the lsblk tree; for a `crypt` device this is its container.
    pub parent: Option<PathBuf>,
}

impl BlockDevice {
    pub fn is_luks_container(&self) -> bool {
        self.fstype.as_deref() == Some(LUKS_FSTYPE)
    }
}

/// Lookup interface the resolver depends on.
pub trait DeviceInventory {
    /// Map an fstab specifier to the matching device. Fails with
    /// `DeviceNotFound` when nothing matches and `AmbiguousSpecifier` when
    /// more than one device does.
    fn find(&self, spec: &DeviceSpec) -> Result<BlockDevice, ResolutionError>;

    /// Look up a device by its path, if the inventory knows it.
    fn by_path(&self, path: &Path) -> Option<BlockDevice>;

    /// Whether the path refers to an object confirmed to exist.
    fn exists(&self, path: &Path) -> bool;
}

fn find_in(devices: &[BlockDevice], spec: &DeviceSpec) -> Result<BlockDevice, ResolutionError> {
    let matches: Vec<&BlockDevice> = devices
        .iter()
        .filter(|d| match spec {
            DeviceSpec::Uuid(v) => d.uuid.as_deref() == Some(v),
            DeviceSpec::Label(v) => d.label.as_deref() == Some(v),
            DeviceSpec::PartUuid(v) => d.partuuid.as_deref() == Some(v),
            DeviceSpec::PartLabel(v) => d.partlabel.as_deref() == Some(v),
            DeviceSpec::Path(v) => d.path == Path::new(v),
        })
        .collect();

    match matches.len() {
        0 => Err(ResolutionError::DeviceNotFound {
            spec: spec.to_string(),
        }),
        1 => Ok(matches[0].clone()),
        count => Err(ResolutionError::AmbiguousSpecifier {
            spec: spec.to_string(),
            count,
        }),
    }
}

// =============================================================================
// SystemInventory: lsblk snapshot
// =============================================================================

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    partlabel: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(rename = "type", default)]
    devtype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Inventory backed by a one-shot `lsblk -J` snapshot of the running system.
#[derive(Debug)]
pub struct SystemInventory {
    devices: Vec<BlockDevice>,
}

impl SystemInventory {
    /// Snapshot the host's block devices. `timeout` bounds the lsblk call.
    pub fn scan(timeout: Duration) -> Result<Self, ResolutionError> {
        let result = Cmd::new("lsblk")
            .args([
                "-J",
                "-o",
                "NAME,PATH,UUID,LABEL,PARTUUID,PARTLABEL,FSTYPE,TYPE",
            ])
            .timeout(timeout)
            .error_msg("lsblk inventory scan failed")
            .run()
            .map_err(|e| {
                if e.downcast_ref::<CommandTimeout>().is_some() {
                    ResolutionError::Timeout {
                        seconds: timeout.as_secs(),
                    }
                } else {
                    ResolutionError::InventoryUnavailable(e.to_string())
                }
            })?;

        Self::from_lsblk_json(&result.stdout)
    }

    /// Build an inventory from captured `lsblk -J` output.
    pub fn from_lsblk_json(json: &str) -> Result<Self, ResolutionError> {
        let report: LsblkReport = serde_json::from_str(json)
            .map_err(|e| ResolutionError::InventoryUnavailable(format!("lsblk JSON: {}", e)))?;

        let mut devices = Vec::new();
        for device in &report.blockdevices {
            flatten(device, None, &mut devices);
        }
        debug!(count = devices.len(), "block device inventory loaded");
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[BlockDevice] {
        &self.devices
    }
}

fn flatten(node: &LsblkDevice, parent: Option<&Path>, out: &mut Vec<BlockDevice>) {
    let path = node
        .path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", node.name)));

    out.push(BlockDevice {
        path: path.clone(),
        uuid: node.uuid.clone(),
        label: node.label.clone(),
        partuuid: node.partuuid.clone(),
        partlabel: node.partlabel.clone(),
        fstype: node.fstype.clone(),
        devtype: node.devtype.clone(),
        parent: parent.map(Path::to_path_buf),
    });

    for child in &node.children {
        flatten(child, Some(&path), out);
    }
}

impl DeviceInventory for SystemInventory {
    fn find(&self, spec: &DeviceSpec) -> Result<BlockDevice, ResolutionError> {
        find_in(&self.devices, spec)
    }

    fn by_path(&self, path: &Path) -> Option<BlockDevice> {
        self.devices.iter().find(|d| d.path == path).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        // The snapshot is authoritative for devices it saw; fall back to the
        // filesystem for nodes lsblk does not list (e.g. bind sources).
        self.devices.iter().any(|d| d.path == path) || path.exists()
    }
}

// =============================================================================
// StaticInventory: fixed device set for tests and offline dry runs
// =============================================================================

/// In-memory inventory with a fixed device list.
#[derive(Debug, Default)]
pub struct StaticInventory {
    devices: Vec<BlockDevice>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: BlockDevice) -> &mut Self {
        self.devices.push(device);
        self
    }

    /// Shorthand for a plain filesystem partition.
    pub fn add_partition(&mut self, path: &str, uuid: &str, fstype: &str) -> &mut Self {
        self.add(BlockDevice {
            path: PathBuf::from(path),
            uuid: Some(uuid.to_string()),
            fstype: Some(fstype.to_string()),
            devtype: Some("part".to_string()),
            ..Default::default()
        })
    }

    /// Shorthand for a LUKS container partition.
    pub fn add_luks_container(&mut self, path: &str, uuid: &str) -> &mut Self {
        self.add(BlockDevice {
            path: PathBuf::from(path),
            uuid: Some(uuid.to_string()),
            fstype: Some(LUKS_FSTYPE.to_string()),
            devtype: Some("part".to_string()),
            ..Default::default()
        })
    }
}

impl DeviceInventory for StaticInventory {
    fn find(&self, spec: &DeviceSpec) -> Result<BlockDevice, ResolutionError> {
        find_in(&self.devices, spec)
    }

    fn by_path(&self, path: &Path) -> Option<BlockDevice> {
        self.devices.iter().find(|d| d.path == path).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        self.devices.iter().any(|d| d.path == path)
    }
}
