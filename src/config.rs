//! Configuration management for autochroot.
//!
//! Reads an INI-style file with `[section]` headers and `key = value` lines.
//! Every field has a documented default; unknown sections and keys are
//! ignored (debug-logged) so old configs keep working, but a value that
//! fails to parse as its expected type aborts the load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/autochroot.conf";

/// `[general]` section.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Where the generated script is installed.
    pub output_path: PathBuf,
    /// Mount table to read.
    pub fstab_path: PathBuf,
    /// Root under which the script mounts everything.
    pub mount_root: PathBuf,
    /// Run log destination.
    pub log_file: PathBuf,
    /// trace/debug/info/warn/error.
    pub log_level: String,
    /// Skip-and-warn instead of aborting on per-record parse/resolution errors.
    pub lenient: bool,
}

/// `[luks]` section. Parameters baked into emitted `cryptsetup open` calls.
#[derive(Debug, Clone)]
pub struct LuksConfig {
    /// Prefix for deterministic mapper aliases (alias = prefix + UUID).
    pub alias_prefix: String,
    /// Seconds cryptsetup waits for a passphrase.
    pub unlock_timeout: u64,
    /// Passphrase attempts before the unlock step fails.
    pub max_attempts: u32,
}

/// `[btrfs]` section.
#[derive(Debug, Clone)]
pub struct BtrfsConfig {
    /// When a btrfs entry has no subvol option, append `default_options`
    /// instead of mounting it as a plain filesystem.
    pub auto_detect: bool,
    /// Options appended by auto-detection (comma separated).
    pub default_options: String,
}

/// `[mount]` section.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Options stripped from generated mount commands (comma separated).
    pub ignored_options: Vec<String>,
    /// Seconds allowed for the device-inventory snapshot command.
    pub lookup_timeout: u64,
    /// Emit an advisory read-only fsck before each real mount.
    pub fsck_check: bool,
}

/// `[script]` section. Toggles for blocks of the generated script.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Check required tools exist before doing anything.
    pub advanced_checks: bool,
    pub colored_output: bool,
    /// Register the reverse-unmount cleanup trap.
    pub auto_cleanup: bool,
    /// Copy the rescue system's resolv.conf into the target.
    pub copy_resolv_conf: bool,
    /// Append the proc/sys/dev/run block after the real mounts.
    pub mount_pseudo_fs: bool,
}

/// `[safety]` section.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Fail resolution when a backing device cannot be confirmed to exist.
    pub verify_devices: bool,
    pub backup_old_script: bool,
    /// Fixed backup destination; empty means a timestamped sibling file.
    pub backup_path: Option<PathBuf>,
    /// Probe the output directory for writability before the write.
    pub check_permissions: bool,
}

/// `[advanced]` section.
#[derive(Debug, Clone)]
pub struct AdvancedConfig {
    /// Emit `vgchange -ay` before the unlock/mount steps.
    pub detect_lvm: bool,
    /// Emit `mdadm --assemble --scan` before the unlock/mount steps.
    pub detect_raid: bool,
    /// Emit an lsblk dump at the top of the script.
    pub debug_info: bool,
    /// Source pre/post hook scripts from /etc/autochroot/hooks.d.
    pub generate_hooks: bool,
}

/// Full engine configuration, one struct per file section.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub luks: LuksConfig,
    pub btrfs: BtrfsConfig,
    pub mount: MountConfig,
    pub script: ScriptConfig,
    pub safety: SafetyConfig,
    pub advanced: AdvancedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                output_path: PathBuf::from("/usr/local/bin/perform-chroot.sh"),
                fstab_path: PathBuf::from("/etc/fstab"),
                mount_root: PathBuf::from("/mnt"),
                log_file: PathBuf::from("/var/log/autochroot.log"),
                log_level: "info".to_string(),
                lenient: false,
            },
            luks: LuksConfig {
                alias_prefix: "luks-".to_string(),
                unlock_timeout: 60,
                max_attempts: 3,
            },
            btrfs: BtrfsConfig {
                auto_detect: false,
                default_options: "subvol=@".to_string(),
            },
            mount: MountConfig {
                ignored_options: vec!["defaults".to_string()],
                lookup_timeout: 10,
                fsck_check: false,
            },
            script: ScriptConfig {
                advanced_checks: true,
                colored_output: true,
                auto_cleanup: true,
                copy_resolv_conf: true,
                mount_pseudo_fs: true,
            },
            safety: SafetyConfig {
                verify_devices: true,
                backup_old_script: true,
                backup_path: None,
                check_permissions: true,
            },
            advanced: AdvancedConfig {
                detect_lvm: false,
                detect_raid: false,
                debug_info: false,
                generate_hooks: false,
            },
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults for every
    /// missing section and key. A missing file is not an error; a file that
    /// exists but cannot be read, or a value of the wrong type, is.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse configuration text. Exposed for tests.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let sections = parse_sections(content);
        let mut config = Self::default();

        if let Some(kv) = sections.get("general") {
            let g = &mut config.general;
            get_path(kv, "output_path", &mut g.output_path);
            get_path(kv, "fstab_path", &mut g.fstab_path);
            get_path(kv, "mount_root", &mut g.mount_root);
            get_path(kv, "log_file", &mut g.log_file);
            get_string(kv, "log_level", &mut g.log_level);
            get_bool(kv, "lenient", &mut g.lenient)?;
        }
        if let Some(kv) = sections.get("luks") {
            let l = &mut config.luks;
            get_string(kv, "alias_prefix", &mut l.alias_prefix);
            get_u64(kv, "unlock_timeout", &mut l.unlock_timeout)?;
            get_u32(kv, "max_attempts", &mut l.max_attempts)?;
        }
        if let Some(kv) = sections.get("btrfs") {
            let b = &mut config.btrfs;
            get_bool(kv, "auto_detect", &mut b.auto_detect)?;
            get_string(kv, "default_options", &mut b.default_options);
        }
        if let Some(kv) = sections.get("mount") {
            let m = &mut config.mount;
            if let Some(v) = kv.get("ignored_options") {
                m.ignored_options = v
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            get_u64(kv, "lookup_timeout", &mut m.lookup_timeout)?;
            get_bool(kv, "fsck_check", &mut m.fsck_check)?;
        }
        if let Some(kv) = sections.get("script") {
            let s = &mut config.script;
            get_bool(kv, "advanced_checks", &mut s.advanced_checks)?;
            get_bool(kv, "colored_output", &mut s.colored_output)?;
            get_bool(kv, "auto_cleanup", &mut s.auto_cleanup)?;
            get_bool(kv, "copy_resolv_conf", &mut s.copy_resolv_conf)?;
            get_bool(kv, "mount_pseudo_fs", &mut s.mount_pseudo_fs)?;
        }
        if let Some(kv) = sections.get("safety") {
            let s = &mut config.safety;
            get_bool(kv, "verify_devices", &mut s.verify_devices)?;
            get_bool(kv, "backup_old_script", &mut s.backup_old_script)?;
            if let Some(v) = kv.get("backup_path") {
                s.backup_path = if v.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(v))
                };
            }
            get_bool(kv, "check_permissions", &mut s.check_permissions)?;
        }
        if let Some(kv) = sections.get("advanced") {
            let a = &mut config.advanced;
            get_bool(kv, "detect_lvm", &mut a.detect_lvm)?;
            get_bool(kv, "detect_raid", &mut a.detect_raid)?;
            get_bool(kv, "debug_info", &mut a.debug_info)?;
            get_bool(kv, "generate_hooks", &mut a.generate_hooks)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.luks.alias_prefix.is_empty() {
            return Err(Error::Config("luks.alias_prefix must not be empty".into()));
        }
        if self.luks.max_attempts == 0 {
            return Err(Error::Config("luks.max_attempts must be at least 1".into()));
        }
        if !self.general.mount_root.is_absolute() {
            return Err(Error::Config(format!(
                "general.mount_root must be absolute, got '{}'",
                self.general.mount_root.display()
            )));
        }
        if !self.general.output_path.is_absolute() {
            return Err(Error::Config(format!(
                "general.output_path must be absolute, got '{}'",
                self.general.output_path.display()
            )));
        }
        Ok(())
    }
}

type Section = HashMap<String, String>;

/// Split INI-style text into section maps. Blank lines and `#`/`;` comments
/// are skipped, as are lines outside any section. Inline ` # ` comments after
/// a value are stripped.
fn parse_sections(content: &str) -> HashMap<String, Section> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = name.trim().to_lowercase();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let Some(section) = &current else {
            debug!(line, "config line outside any section, ignoring");
            continue;
        };
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_lowercase();
            let mut value = value.trim();
            if let Some(idx) = value.find(" #") {
                value = value[..idx].trim_end();
            }
            let value = value.trim_matches('"').trim_matches('\'');
            sections
                .get_mut(section)
                .expect("section inserted above")
                .insert(key, value.to_string());
        } else {
            debug!(line, "config line is not key = value, ignoring");
        }
    }
    sections
}

fn get_string(kv: &Section, key: &str, target: &mut String) {
    if let Some(v) = kv.get(key) {
        *target = v.clone();
    }
}

fn get_path(kv: &Section, key: &str, target: &mut PathBuf) {
    if let Some(v) = kv.get(key) {
        *target = PathBuf::from(v);
    }
}

fn get_bool(kv: &Section, key: &str, target: &mut bool) -> Result<(), Error> {
    if let Some(v) = kv.get(key) {
        *target = match v.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            other => {
                return Err(Error::Config(format!(
                    "expected boolean for '{}', got '{}'",
                    key, other
                )))
            }
        };
    }
    Ok(())
}

fn get_u64(kv: &Section, key: &str, target: &mut u64) -> Result<(), Error> {
    if let Some(v) = kv.get(key) {
        *target = v
            .parse()
            .map_err(|_| Error::Config(format!("expected integer for '{}', got '{}'", key, v)))?;
    }
    Ok(())
}

fn get_u32(kv: &Section, key: &str, target: &mut u32) -> Result<(), Error> {
    if let Some(v) = kv.get(key) {
        *target = v
            .parse()
            .map_err(|_| Error::Config(format!("expected integer for '{}', got '{}'", key, v)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(Path::new("/nonexistent/autochroot.conf")).unwrap();
        assert_eq!(config.general.fstab_path, PathBuf::from("/etc/fstab"));
        assert_eq!(config.luks.alias_prefix, "luks-");
        assert!(!config.general.lenient);
        assert!(config.safety.backup_old_script);
    }

    #[test]
    fn test_parse_sections_and_overrides() {
        let config = Config::parse(
            r#"
            [general]
            fstab_path = /tmp/fstab
            lenient = yes

            [luks]
            alias_prefix = crypt-
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.general.fstab_path, PathBuf::from("/tmp/fstab"));
        assert!(config.general.lenient);
        assert_eq!(config.luks.alias_prefix, "crypt-");
        assert_eq!(config.luks.max_attempts, 5);
        // untouched sections keep defaults
        assert_eq!(config.mount.lookup_timeout, 10);
    }

    #[test]
    fn test_unknown_keys_and_sections_ignored() {
        let config = Config::parse(
            r#"
            [general]
            no_such_key = whatever

            [shiny_future_section]
            foo = bar
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_inline_comments_stripped() {
        let config = Config::parse("[luks]\nunlock_timeout = 30 # half a minute\n").unwrap();
        assert_eq!(config.luks.unlock_timeout, 30);
    }

    #[test]
    fn test_bad_bool_fails() {
        let err = Config::parse("[general]\nlenient = maybe\n").unwrap_err();
        assert!(err.to_string().contains("lenient"));
    }

    #[test]
    fn test_bad_int_fails() {
        assert!(Config::parse("[luks]\nunlock_timeout = soon\n").is_err());
    }

    #[test]
    fn test_empty_alias_prefix_rejected() {
        assert!(Config::parse("[luks]\nalias_prefix = \"\"\n").is_err());
    }

    #[test]
    fn test_ignored_options_list() {
        let config = Config::parse("[mount]\nignored_options = defaults, nofail ,\n").unwrap();
        assert_eq!(config.mount.ignored_options, vec!["defaults", "nofail"]);
    }

    #[test]
    fn test_backup_path_empty_means_timestamped() {
        let config = Config::parse("[safety]\nbackup_path =\n").unwrap();
        assert!(config.safety.backup_path.is_none());
        let config = Config::parse("[safety]\nbackup_path = /root/old.sh\n").unwrap();
        assert_eq!(
            config.safety.backup_path,
            Some(PathBuf::from("/root/old.sh"))
        );
    }
}
