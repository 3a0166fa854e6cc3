//! Error taxonomy for the generation engine.
//!
//! Each pipeline stage has its own error class so callers (and the exit path
//! in `main`) can tell a malformed fstab apart from a missing device or a
//! failed write. Strict/lenient downgrade decisions happen in the engine, not
//! here.

use std::path::PathBuf;
use thiserror::Error;

/// Any failure the engine can produce.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Malformed mount-table input.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("fstab line {line}: expected 6 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("fstab line {line}: empty device specifier")]
    EmptyDevice { line: usize },

    #[error("fstab line {line}: mount point '{mount_point}' is not absolute")]
    RelativeMountPoint { line: usize, mount_point: String },

    #[error("fstab line {line}: duplicate mount point '{mount_point}'")]
    DuplicateMountPoint { line: usize, mount_point: String },

    #[error("fstab line {line}: invalid {field} value '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("cannot read fstab at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A mount record could not be mapped to a concrete, existing storage object.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("device not found for specifier '{spec}'")]
    DeviceNotFound { spec: String },

    #[error("specifier '{spec}' matches {count} devices")]
    AmbiguousSpecifier { spec: String, count: usize },

    #[error("device inventory lookup exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },

    #[error("unsupported filesystem type '{fstype}' for {mount_point}")]
    UnsupportedFilesystem {
        fstype: String,
        mount_point: String,
    },

    #[error("device inventory unavailable: {0}")]
    InventoryUnavailable(String),
}

/// The resolved volumes cannot be ordered into a valid plan.
///
/// Both variants are defensive: mount-point uniqueness and prefix ordering
/// make them structurally unreachable from a clean parse, but a lenient-mode
/// skip can orphan a mapper-backed mount.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("mount ordering cycle involving '{mount_point}'")]
    Cycle { mount_point: String },

    #[error("mount of '{spec}' needs unlock of alias '{alias}' which is not in the plan")]
    MissingDependency { spec: String, alias: String },

    #[error("duplicate mount point '{mount_point}' in plan")]
    DuplicateMountPoint { mount_point: String },
}

/// Writing the generated script failed. Always fatal.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("refusing to write a script with no real mount steps")]
    EmptyPlan,

    #[error("refusing to write a script that never mounts the root filesystem")]
    NoRootMount,

    #[error("output directory {dir} is not writable: {reason}")]
    NotWritable { dir: PathBuf, reason: String },

    #[error("failed to back up existing script to {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move {from} into place at {to}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Short class name for log lines and exit reporting.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Parse(_) => "ParseError",
            Error::Resolution(_) => "ResolutionError",
            Error::Plan(_) => "PlanError",
            Error::Write(_) => "WriteError",
            Error::Config(_) => "ConfigError",
        }
    }
}
