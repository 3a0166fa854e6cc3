//! Mount-table parsing.
//!
//! Turns fstab text into an ordered list of [`MountRecord`]s. Each
//! non-comment line must carry exactly six whitespace-separated fields
//! (spec, target, fstype, options, dump, pass). Swap and kernel
//! pseudo-filesystem entries are not chroot-relevant and are skipped
//! silently; genuinely malformed lines are a [`ParseError`] in strict mode
//! and a logged skip in lenient mode.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::config::MountConfig;
use crate::error::ParseError;

/// Filesystem types that never belong in the generated script.
const SKIP_FSTYPES: &[&str] = &[
    "swap",
    "tmpfs",
    "proc",
    "sysfs",
    "devtmpfs",
    "devpts",
    "cgroup",
    "cgroup2",
    "securityfs",
    "debugfs",
    "configfs",
    "autofs",
    "overlay",
];

/// How the first fstab field identifies its device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    Uuid(String),
    Label(String),
    PartUuid(String),
    PartLabel(String),
    Path(String),
}

impl DeviceSpec {
    /// Parse an fstab device field. Anything that is not a known `TAG=` form
    /// or an absolute path is rejected.
    pub fn parse(field: &str) -> Option<Self> {
        if let Some(v) = field.strip_prefix("UUID=") {
            Some(DeviceSpec::Uuid(v.to_string()))
        } else if let Some(v) = field.strip_prefix("LABEL=") {
            Some(DeviceSpec::Label(v.to_string()))
        } else if let Some(v) = field.strip_prefix("PARTUUID=") {
            Some(DeviceSpec::PartUuid(v.to_string()))
        } else if let Some(v) = field.strip_prefix("PARTLABEL=") {
            Some(DeviceSpec::PartLabel(v.to_string()))
        } else if field.starts_with("/dev/") {
            Some(DeviceSpec::Path(field.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Uuid(v) => write!(f, "UUID={}", v),
            DeviceSpec::Label(v) => write!(f, "LABEL={}", v),
            DeviceSpec::PartUuid(v) => write!(f, "PARTUUID={}", v),
            DeviceSpec::PartLabel(v) => write!(f, "PARTLABEL={}", v),
            DeviceSpec::Path(v) => write!(f, "{}", v),
        }
    }
}

/// One normalized fstab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub spec: DeviceSpec,
    pub mount_point: String,
    pub fs_type: String,
    /// Options with the configured ignore-list already removed.
    pub options: Vec<String>,
    pub dump: u32,
    pub pass: u32,
    /// 1-based source line, for diagnostics.
    pub line: usize,
}

impl MountRecord {
    /// Mount-point depth: `/` is 0, `/boot` is 1, `/boot/efi` is 2.
    pub fn depth(&self) -> usize {
        if self.mount_point == "/" {
            0
        } else {
            self.mount_point.matches('/').count()
        }
    }

    /// Value of the first `subvol=` option, if any.
    pub fn subvol_option(&self) -> Option<&str> {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix("subvol="))
    }
}

/// Result of a parse: the records plus any lenient-mode skip warnings.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<MountRecord>,
    pub warnings: Vec<String>,
}

/// Parse mount-table text, preserving source order.
pub fn parse_fstab(
    content: &str,
    mount: &MountConfig,
    lenient: bool,
) -> Result<ParseOutcome, ParseError> {
    let mut outcome = ParseOutcome::default();
    let mut seen_targets: HashSet<String> = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line, line_no, mount, &mut seen_targets) {
            Ok(Some(record)) => {
                debug!(
                    mount_point = %record.mount_point,
                    device = %record.spec,
                    "parsed fstab entry"
                );
                outcome.records.push(record);
            }
            Ok(None) => {}
            Err(e) if lenient => {
                warn!(line = line_no, "skipping fstab entry: {}", e);
                outcome.warnings.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcome)
}

/// Parse a single entry line. `Ok(None)` means the entry is valid but not
/// chroot-relevant (swap, pseudo filesystems, `none` targets).
fn parse_line(
    line: &str,
    line_no: usize,
    mount: &MountConfig,
    seen_targets: &mut HashSet<String>,
) -> Result<Option<MountRecord>, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(ParseError::FieldCount {
            line: line_no,
            found: fields.len(),
        });
    }

    let (device, target, fs_type, options, dump, pass) = (
        fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
    );

    if device.is_empty() {
        return Err(ParseError::EmptyDevice { line: line_no });
    }

    // Entries that exist in fstab but have no place in a chroot script.
    if target == "none" || target == "swap" || SKIP_FSTYPES.contains(&fs_type) {
        debug!(line = line_no, fs_type, "skipping non-chroot entry");
        return Ok(None);
    }

    let Some(spec) = DeviceSpec::parse(device) else {
        return Err(ParseError::InvalidField {
            line: line_no,
            field: "device",
            value: device.to_string(),
        });
    };

    if !target.starts_with('/') {
        return Err(ParseError::RelativeMountPoint {
            line: line_no,
            mount_point: target.to_string(),
        });
    }
    if !seen_targets.insert(target.to_string()) {
        return Err(ParseError::DuplicateMountPoint {
            line: line_no,
            mount_point: target.to_string(),
        });
    }

    let dump: u32 = dump.parse().map_err(|_| ParseError::InvalidField {
        line: line_no,
        field: "dump",
        value: dump.to_string(),
    })?;
    let pass: u32 = pass.parse().map_err(|_| ParseError::InvalidField {
        line: line_no,
        field: "pass",
        value: pass.to_string(),
    })?;

    let options: Vec<String> = options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty() && !mount.ignored_options.iter().any(|i| i == o))
        .map(str::to_string)
        .collect();

    Ok(Some(MountRecord {
        spec,
        mount_point: target.to_string(),
        fs_type: fs_type.to_string(),
        options,
        dump,
        pass,
        line: line_no,
    }))
}
