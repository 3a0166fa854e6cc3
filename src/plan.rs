//! Mount planning: ordering resolved volumes into an executable sequence.
//!
//! Ordering is by mount-point depth ascending, ties broken lexicographically,
//! which guarantees every parent mount point is mounted before its children
//! (a strict path prefix always has strictly fewer components). Unlock steps
//! are inserted immediately before the first mount that needs them, and the
//! pseudo-filesystem block is appended last in a fixed canonical order.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::debug;

use crate::config::Config;
use crate::error::PlanError;
use crate::resolve::{ResolvedVolume, VolumeKind};

/// Kernel filesystems that must be present inside the target root for a
/// chroot to function. Order here is the order in the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoFs {
    Proc,
    Sys,
    Dev,
    DevPts,
    Run,
}

impl PseudoFs {
    pub const ALL: [PseudoFs; 5] = [
        PseudoFs::Proc,
        PseudoFs::Sys,
        PseudoFs::Dev,
        PseudoFs::DevPts,
        PseudoFs::Run,
    ];

    /// Target path relative to the mount root.
    pub fn target(&self) -> &'static str {
        match self {
            PseudoFs::Proc => "proc",
            PseudoFs::Sys => "sys",
            PseudoFs::Dev => "dev",
            PseudoFs::DevPts => "dev/pts",
            PseudoFs::Run => "run",
        }
    }

    /// Whether this is a bind of a host directory rather than a fresh
    /// filesystem instance.
    pub fn bind_source(&self) -> Option<&'static str> {
        match self {
            PseudoFs::Dev => Some("/dev"),
            PseudoFs::DevPts => Some("/dev/pts"),
            PseudoFs::Run => Some("/run"),
            _ => None,
        }
    }

    pub fn fstype(&self) -> Option<&'static str> {
        match self {
            PseudoFs::Proc => Some("proc"),
            PseudoFs::Sys => Some("sysfs"),
            _ => None,
        }
    }
}

/// One step of the ordered plan.
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Open a LUKS container as `/dev/mapper/<alias>`.
    Unlock { device: PathBuf, alias: String },
    /// Mount a real filesystem.
    Mount(ResolvedVolume),
    /// Mount or bind one pseudo filesystem into the target root.
    Pseudo(PseudoFs),
}

/// Strictly ordered mount plan.
#[derive(Debug, Default)]
pub struct MountPlan {
    pub steps: Vec<PlanStep>,
}

impl MountPlan {
    /// Number of real (non-pseudo) mount steps.
    pub fn real_mount_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Mount(_)))
            .count()
    }

    /// Whether the plan mounts the root filesystem itself.
    pub fn mounts_root(&self) -> bool {
        self.steps.iter().any(
            |s| matches!(s, PlanStep::Mount(v) if v.mount_point() == "/"),
        )
    }

    /// Mount points of the real mounts, in plan order.
    pub fn mount_points(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::Mount(v) => Some(v.mount_point()),
                _ => None,
            })
            .collect()
    }
}

/// Build the ordered plan from resolved volumes.
pub fn build_plan(volumes: Vec<ResolvedVolume>, config: &Config) -> Result<MountPlan, PlanError> {
    check_unique_mount_points(&volumes)?;

    let mut volumes = volumes;
    volumes.sort_by(|a, b| {
        (a.record.depth(), a.mount_point()).cmp(&(b.record.depth(), b.mount_point()))
    });
    check_prefix_order(&volumes)?;

    let mut plan = MountPlan::default();
    let mut unlocked: HashSet<String> = HashSet::new();

    for volume in volumes {
        if let VolumeKind::Encrypted { alias } = &volume.kind {
            // One container may back several mounts; unlock it once, just
            // before its first dependent mount.
            if unlocked.insert(alias.clone()) {
                plan.steps.push(PlanStep::Unlock {
                    device: volume.backing.clone(),
                    alias: alias.clone(),
                });
            }
        } else {
            check_mapper_dependency(&volume, &unlocked, config)?;
        }
        plan.steps.push(PlanStep::Mount(volume));
    }

    if config.script.mount_pseudo_fs {
        for pseudo in PseudoFs::ALL {
            plan.steps.push(PlanStep::Pseudo(pseudo));
        }
    }

    debug!(
        real_mounts = plan.real_mount_count(),
        steps = plan.steps.len(),
        "mount plan built"
    );
    Ok(plan)
}

fn check_unique_mount_points(volumes: &[ResolvedVolume]) -> Result<(), PlanError> {
    let mut seen = HashSet::new();
    for volume in volumes {
        if !seen.insert(volume.mount_point()) {
            return Err(PlanError::DuplicateMountPoint {
                mount_point: volume.mount_point().to_string(),
            });
        }
    }
    Ok(())
}

/// Defensive verification that the sorted order satisfies the prefix
/// invariant. Unreachable from a clean sort, since a strict prefix always
/// has smaller depth.
fn check_prefix_order(sorted: &[ResolvedVolume]) -> Result<(), PlanError> {
    for (i, later) in sorted.iter().enumerate() {
        for earlier in &sorted[..i] {
            if is_strict_prefix(later.mount_point(), earlier.mount_point()) {
                return Err(PlanError::Cycle {
                    mount_point: later.mount_point().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// A non-encrypted volume whose source lives under /dev/mapper/ with the
/// configured alias prefix depends on an unlock step the plan does not
/// contain. This happens when the container's own record was skipped in
/// lenient mode.
fn check_mapper_dependency(
    volume: &ResolvedVolume,
    unlocked: &HashSet<String>,
    config: &Config,
) -> Result<(), PlanError> {
    let source = volume.mount_source();
    let Ok(rest) = source.strip_prefix("/dev/mapper") else {
        return Ok(());
    };
    let alias = rest.to_string_lossy().to_string();
    if alias.starts_with(&config.luks.alias_prefix) && !unlocked.contains(&alias) {
        return Err(PlanError::MissingDependency {
            spec: source.display().to_string(),
            alias,
        });
    }
    Ok(())
}

/// True if `prefix` is a strict path-component prefix of `path`.
fn is_strict_prefix(prefix: &str, path: &str) -> bool {
    if prefix == path {
        return false;
    }
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fstab::parse_fstab;
    use crate::inventory::StaticInventory;
    use crate::resolve::VolumeResolver;

    fn resolve_all(fstab: &str, inventory: &StaticInventory, config: &Config) -> Vec<ResolvedVolume> {
        let outcome = parse_fstab(fstab, &config.mount, false).unwrap();
        let resolver = VolumeResolver::new(config, inventory);
        outcome
            .records
            .iter()
            .map(|r| resolver.resolve(r).unwrap())
            .collect()
    }

    #[test]
    fn test_depth_ordering_root_first() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "efi", "vfat");
        inventory.add_partition("/dev/sda2", "boot", "ext4");
        inventory.add_partition("/dev/sda3", "root", "ext4");

        // fstab deliberately out of order
        let volumes = resolve_all(
            "UUID=efi /boot/efi vfat umask=0077 0 2\n\
             UUID=boot /boot ext4 defaults 0 2\n\
             UUID=root / ext4 defaults 0 1\n",
            &inventory,
            &config,
        );
        let plan = build_plan(volumes, &config).unwrap();
        assert_eq!(plan.mount_points(), vec!["/", "/boot", "/boot/efi"]);
    }

    #[test]
    fn test_lexicographic_tiebreak_at_equal_depth() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "root", "ext4");
        inventory.add_partition("/dev/sda2", "var", "ext4");
        inventory.add_partition("/dev/sda3", "home", "ext4");

        let volumes = resolve_all(
            "UUID=root / ext4 defaults 0 1\n\
             UUID=var /var ext4 defaults 0 2\n\
             UUID=home /home ext4 defaults 0 2\n",
            &inventory,
            &config,
        );
        let plan = build_plan(volumes, &config).unwrap();
        assert_eq!(plan.mount_points(), vec!["/", "/home", "/var"]);
    }

    #[test]
    fn test_unlock_before_dependent_mount_and_only_once() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_luks_container("/dev/sda2", "crypt-uuid");

        let outcome = parse_fstab(
            "UUID=crypt-uuid / btrfs subvol=@ 0 1\n",
            &config.mount,
            false,
        )
        .unwrap();
        let resolver = VolumeResolver::new(&config, &inventory);
        let volumes: Vec<_> = outcome
            .records
            .iter()
            .map(|r| resolver.resolve(r).unwrap())
            .collect();

        let plan = build_plan(volumes, &config).unwrap();
        match (&plan.steps[0], &plan.steps[1]) {
            (PlanStep::Unlock { alias, device }, PlanStep::Mount(v)) => {
                assert_eq!(alias, "luks-crypt-uuid");
                assert_eq!(device, &PathBuf::from("/dev/sda2"));
                assert_eq!(v.mount_point(), "/");
            }
            other => panic!("unexpected plan head: {other:?}"),
        }
    }

    #[test]
    fn test_shared_container_unlocked_once() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_luks_container("/dev/sda2", "crypt-uuid");

        let volumes = resolve_all(
            "UUID=crypt-uuid / btrfs subvol=@ 0 1\n\
             UUID=crypt-uuid /home btrfs subvol=@home 0 2\n",
            &inventory,
            &config,
        );
        // Both records share the container: same UUID twice is fine because
        // the mount points differ.
        let plan = build_plan(volumes, &config).unwrap();
        let unlocks = plan
            .steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Unlock { .. }))
            .count();
        assert_eq!(unlocks, 1);
        assert_eq!(plan.real_mount_count(), 2);
    }

    #[test]
    fn test_pseudo_block_appended_in_canonical_order() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "root", "ext4");

        let volumes = resolve_all("UUID=root / ext4 defaults 0 1\n", &inventory, &config);
        let plan = build_plan(volumes, &config).unwrap();

        let tail: Vec<PseudoFs> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::Pseudo(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(tail, PseudoFs::ALL.to_vec());
        // and they come after every real mount
        let last_mount = plan
            .steps
            .iter()
            .rposition(|s| matches!(s, PlanStep::Mount(_)))
            .unwrap();
        let first_pseudo = plan
            .steps
            .iter()
            .position(|s| matches!(s, PlanStep::Pseudo(_)))
            .unwrap();
        assert!(last_mount < first_pseudo);
    }

    #[test]
    fn test_pseudo_block_disabled() {
        let mut config = Config::default();
        config.script.mount_pseudo_fs = false;
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "root", "ext4");

        let volumes = resolve_all("UUID=root / ext4 defaults 0 1\n", &inventory, &config);
        let plan = build_plan(volumes, &config).unwrap();
        assert!(!plan.steps.iter().any(|s| matches!(s, PlanStep::Pseudo(_))));
    }

    #[test]
    fn test_missing_unlock_dependency_detected() {
        let mut config = Config::default();
        config.safety.verify_devices = false;
        let inventory = StaticInventory::new();

        // fstab references a mapper device by our alias prefix, but the
        // container record that would contribute the Unlock step is absent.
        let volumes = resolve_all(
            "/dev/mapper/luks-lost /data ext4 defaults 0 2\n",
            &inventory,
            &config,
        );
        let err = build_plan(volumes, &config).unwrap_err();
        assert!(matches!(err, PlanError::MissingDependency { .. }));
    }

    #[test]
    fn test_duplicate_mount_point_defensive_check() {
        let config = Config::default();
        let mut inventory = StaticInventory::new();
        inventory.add_partition("/dev/sda1", "a", "ext4");
        inventory.add_partition("/dev/sda2", "b", "ext4");

        let mut volumes = resolve_all("UUID=a / ext4 defaults 0 1\n", &inventory, &config);
        let mut duplicate = volumes[0].clone();
        duplicate.backing = PathBuf::from("/dev/sda2");
        volumes.push(duplicate);

        let err = build_plan(volumes, &config).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateMountPoint { .. }));
    }

    #[test]
    fn test_is_strict_prefix() {
        assert!(is_strict_prefix("/", "/boot"));
        assert!(is_strict_prefix("/boot", "/boot/efi"));
        assert!(!is_strict_prefix("/boot", "/boot"));
        assert!(!is_strict_prefix("/boot", "/bootstrap"));
        assert!(!is_strict_prefix("/boot/efi", "/boot"));
    }
}
