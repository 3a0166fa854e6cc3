//! End-to-end generation pipeline.
//!
//! parse → resolve → plan → synthesize → guard+write. Each stage consumes
//! only the previous stage's output; the engine itself is a pure function of
//! (table, config, inventory) apart from the final install.
//!
//! Caller obligation: at most one invocation at a time. The SafetyGuard's
//! backup-then-write sequence is not isolated across concurrent processes.

use std::fs;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, ParseError};
use crate::fstab::{parse_fstab, ParseOutcome};
use crate::inventory::DeviceInventory;
use crate::plan::{build_plan, MountPlan, PlanStep};
use crate::resolve::{ResolvedVolume, VolumeResolver};
use crate::safety::{install_script, InstallReport};
use crate::script::{source_hash, ScriptSynthesizer};

/// What to do after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full generation: back up, write, rename.
    Generate,
    /// Resolve and plan only; nothing on disk is touched.
    DryRun,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Human-readable plan, one line per step.
    pub plan_lines: Vec<String>,
    /// The rendered script text.
    pub script_text: String,
    /// Install details; `None` for dry runs.
    pub installed: Option<InstallReport>,
    /// Lenient-mode skip warnings, in occurrence order.
    pub warnings: Vec<String>,
}

/// Run the whole pipeline.
pub fn run(
    config: &Config,
    inventory: &dyn DeviceInventory,
    mode: Mode,
) -> Result<RunOutcome, Error> {
    let lenient = config.general.lenient;
    let fstab_path = &config.general.fstab_path;

    let fstab_text =
        fs::read_to_string(fstab_path).map_err(|source| ParseError::Unreadable {
            path: fstab_path.clone(),
            source,
        })?;

    let ParseOutcome {
        records,
        mut warnings,
    } = parse_fstab(&fstab_text, &config.mount, lenient)?;
    info!(
        records = records.len(),
        path = %fstab_path.display(),
        "mount table parsed"
    );

    let resolver = VolumeResolver::new(config, inventory);
    let mut volumes: Vec<ResolvedVolume> = Vec::with_capacity(records.len());
    for record in &records {
        match resolver.resolve(record) {
            Ok(volume) => volumes.push(volume),
            Err(e) if lenient => {
                warn!(mount_point = %record.mount_point, "skipping record: {}", e);
                warnings.push(e.to_string());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let plan = build_plan(volumes, config)?;
    let plan_lines = describe(&plan);
    for line in &plan_lines {
        info!("plan: {}", line);
    }

    let synthesizer = ScriptSynthesizer::new(config);
    let hash = source_hash(&fstab_text, &format!("{:?}", config));
    let doc = synthesizer.synthesize(&plan, hash);
    let script_text = synthesizer.render(&doc);

    let installed = match mode {
        Mode::DryRun => {
            info!("dry run, skipping backup and write");
            None
        }
        Mode::Generate => {
            let report = install_script(&script_text, &plan, config, doc.generated_at)?;
            if let Some(backup) = &report.backup {
                info!(backup = %backup.display(), "previous script preserved");
            }
            Some(report)
        }
    };

    Ok(RunOutcome {
        plan_lines,
        script_text,
        installed,
        warnings,
    })
}

fn describe(plan: &MountPlan) -> Vec<String> {
    plan.steps
        .iter()
        .map(|step| match step {
            PlanStep::Unlock { device, alias } => {
                format!("unlock {} as /dev/mapper/{}", device.display(), alias)
            }
            PlanStep::Mount(volume) => format!(
                "mount {} on {} ({}{})",
                volume.mount_source().display(),
                volume.mount_point(),
                volume.record.fs_type,
                if volume.options.is_empty() {
                    String::new()
                } else {
                    format!(", {}", volume.options.join(","))
                }
            ),
            PlanStep::Pseudo(pseudo) => format!("pseudo-mount /{}", pseudo.target()),
        })
        .collect()
}
