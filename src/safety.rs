//! SafetyGuard: the only stage that touches the output path.
//!
//! Refuses to install a script that could not possibly be correct (no real
//! mounts, no root mount), preserves the previous script as a backup, probes
//! the output directory for writability, and replaces the script atomically
//! via write-then-rename so a crash mid-write never leaves a truncated
//! executable at the canonical path.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::WriteError;
use crate::plan::MountPlan;

/// Result of a successful install.
#[derive(Debug)]
pub struct InstallReport {
    pub written_to: PathBuf,
    /// Where the previous script went, if one existed and backups are on.
    pub backup: Option<PathBuf>,
}

/// Validate the plan, back up any existing script, and atomically install
/// the rendered text at the configured output path.
pub fn install_script(
    text: &str,
    plan: &MountPlan,
    config: &Config,
    generated_at: DateTime<Utc>,
) -> Result<InstallReport, WriteError> {
    // A plan with zero real mounts means parsing or resolution went wrong
    // upstream; a script built from it would be dangerous to execute.
    if plan.real_mount_count() == 0 {
        return Err(WriteError::EmptyPlan);
    }
    if !plan.mounts_root() {
        return Err(WriteError::NoRootMount);
    }

    let output = &config.general.output_path;
    let dir = output.parent().unwrap_or(Path::new("/"));

    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| WriteError::NotWritable {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    if config.safety.check_permissions {
        probe_writable(dir)?;
    }

    let backup = if output.exists() && config.safety.backup_old_script {
        Some(backup_existing(output, config, generated_at)?)
    } else {
        None
    };

    let tmp = temp_path(output);
    fs::write(&tmp, text).map_err(|source| WriteError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755)).map_err(|source| {
        WriteError::Io {
            path: tmp.clone(),
            source,
        }
    })?;
    fs::rename(&tmp, output).map_err(|source| WriteError::RenameFailed {
        from: tmp.clone(),
        to: output.clone(),
        source,
    })?;

    info!(path = %output.display(), "recovery script installed");
    Ok(InstallReport {
        written_to: output.clone(),
        backup,
    })
}

fn probe_writable(dir: &Path) -> Result<(), WriteError> {
    let probe = dir.join(".autochroot-write-probe");
    match fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(WriteError::NotWritable {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn backup_existing(
    output: &Path,
    config: &Config,
    generated_at: DateTime<Utc>,
) -> Result<PathBuf, WriteError> {
    let dest = match &config.safety.backup_path {
        Some(path) => path.clone(),
        None => {
            let stamp = generated_at.format("%Y%m%d-%H%M%S");
            PathBuf::from(format!("{}.{}.bak", output.display(), stamp))
        }
    };
    fs::copy(output, &dest).map_err(|source| WriteError::BackupFailed {
        path: dest.clone(),
        source,
    })?;
    debug!(backup = %dest.display(), "previous script backed up");
    Ok(dest)
}

fn temp_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string());
    name.push_str(".tmp");
    output.with_file_name(name)
}
