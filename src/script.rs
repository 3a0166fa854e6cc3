//! Script synthesis: from a mount plan to executable shell text.
//!
//! Generation is two-phase. The plan is first lowered to a sequence of
//! abstract [`Instruction`]s, then the renderer turns each instruction into
//! shell lines. No device path, alias, mount point or option string reaches
//! the output without passing through the quoting helpers, and every unlock
//! and mount is guarded so the script can be re-run after a partial failure.
//!
//! The rendered text is deterministic: the header carries the source
//! configuration hash but never a wall-clock timestamp, so unchanged inputs
//! produce byte-identical scripts.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::plan::{MountPlan, PlanStep, PseudoFs};
use crate::resolve::VolumeKind;

/// Hook phases sourced from /etc/autochroot/hooks.d when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreMount,
    PostMount,
}

/// Abstract script instruction. The renderer is the only place that knows
/// shell syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Refuse to run as non-root.
    RequireRoot,
    /// Verify required tools exist before touching anything.
    ToolCheck { tools: Vec<String> },
    /// Dump the block-device layout for troubleshooting.
    DebugInfo,
    /// Assemble software RAID arrays.
    AssembleRaid,
    /// Activate LVM volume groups.
    ActivateLvm,
    /// Register the reverse-order unmount trap.
    Trap,
    /// Open a LUKS container.
    Unlock {
        device: String,
        alias: String,
        timeout: u64,
        tries: u32,
    },
    /// Advisory read-only filesystem check.
    Fsck { device: String },
    /// Mount a filesystem at a target below the mount root.
    Mount {
        source: String,
        /// Mount point as in fstab ("/", "/boot", …); the renderer prefixes
        /// the mount root.
        target: String,
        fstype: Option<String>,
        options: Vec<String>,
    },
    /// Bind a host directory into the target root.
    BindMount { source: String, target: String },
    /// Mount a fresh kernel filesystem instance (proc, sysfs) into the
    /// target root.
    PseudoMount { fstype: String, target: String },
    /// Copy the rescue system's resolv.conf into the target.
    CopyResolvConf,
    /// Source hook scripts for a phase.
    Hook { phase: HookPhase },
    /// Final root change. Nothing may follow this.
    Chroot,
}

/// The emitted artifact: instructions plus metadata. Immutable once built.
#[derive(Debug)]
pub struct ScriptDocument {
    pub instructions: Vec<Instruction>,
    /// sha256 over the source table and configuration, hex-encoded.
    pub source_hash: String,
    /// When this document was synthesized. Logged and used for backup
    /// names, deliberately absent from the rendered text.
    pub generated_at: DateTime<Utc>,
}

/// Hash the inputs that determine the script's content.
pub fn source_hash(fstab_text: &str, config_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fstab_text.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(config_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Renders mount plans into shell scripts according to the configuration.
pub struct ScriptSynthesizer<'a> {
    config: &'a Config,
}

impl<'a> ScriptSynthesizer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Phase one: lower the plan to instructions.
    pub fn synthesize(&self, plan: &MountPlan, source_hash: String) -> ScriptDocument {
        let script = &self.config.script;
        let advanced = &self.config.advanced;
        let mut instructions = Vec::new();

        instructions.push(Instruction::RequireRoot);

        if script.advanced_checks {
            let mut tools = vec!["mount".to_string(), "mountpoint".to_string()];
            if plan
                .steps
                .iter()
                .any(|s| matches!(s, PlanStep::Unlock { .. }))
            {
                tools.push("cryptsetup".to_string());
            }
            instructions.push(Instruction::ToolCheck { tools });
        }
        if advanced.debug_info {
            instructions.push(Instruction::DebugInfo);
        }
        if script.auto_cleanup {
            instructions.push(Instruction::Trap);
        }
        if advanced.detect_raid {
            instructions.push(Instruction::AssembleRaid);
        }
        if advanced.detect_lvm {
            instructions.push(Instruction::ActivateLvm);
        }
        if advanced.generate_hooks {
            instructions.push(Instruction::Hook {
                phase: HookPhase::PreMount,
            });
        }

        for step in &plan.steps {
            match step {
                PlanStep::Unlock { device, alias } => {
                    instructions.push(Instruction::Unlock {
                        device: device.to_string_lossy().into_owned(),
                        alias: alias.clone(),
                        timeout: self.config.luks.unlock_timeout,
                        tries: self.config.luks.max_attempts,
                    });
                }
                PlanStep::Mount(volume) => {
                    let source = volume.mount_source().to_string_lossy().into_owned();
                    if self.config.mount.fsck_check
                        && volume.record.pass > 0
                        && !matches!(volume.kind, VolumeKind::Subvolume { .. })
                    {
                        instructions.push(Instruction::Fsck {
                            device: source.clone(),
                        });
                    }
                    instructions.push(Instruction::Mount {
                        source,
                        target: volume.mount_point().to_string(),
                        fstype: Some(volume.record.fs_type.clone()),
                        options: volume.options.clone(),
                    });
                }
                PlanStep::Pseudo(pseudo) => {
                    instructions.push(pseudo_instruction(*pseudo));
                }
            }
        }

        if script.copy_resolv_conf {
            instructions.push(Instruction::CopyResolvConf);
        }
        if advanced.generate_hooks {
            instructions.push(Instruction::Hook {
                phase: HookPhase::PostMount,
            });
        }
        instructions.push(Instruction::Chroot);

        ScriptDocument {
            instructions,
            source_hash,
            generated_at: Utc::now(),
        }
    }

    /// Phase two: render instructions to shell text.
    pub fn render(&self, doc: &ScriptDocument) -> String {
        let mut out = String::new();
        self.render_prologue(doc, &mut out);
        for instruction in &doc.instructions {
            self.render_instruction(instruction, &mut out);
        }
        out
    }

    fn render_prologue(&self, doc: &ScriptDocument, out: &mut String) {
        out.push_str("#!/usr/bin/env bash\n");
        out.push_str("# Recovery mount script generated by autochroot.\n");
        out.push_str("# Do not edit by hand; rerun autochroot to regenerate.\n");
        out.push_str(&format!("# source-hash: sha256:{}\n", doc.source_hash));
        out.push_str("\nset -euo pipefail\n\n");
        out.push_str(&format!(
            "MNT={}\n",
            sh_quote(&self.config.general.mount_root.to_string_lossy())
        ));
        out.push('\n');

        if self.config.script.colored_output {
            out.push_str("C_INFO=$'\\033[1;34m'\n");
            out.push_str("C_WARN=$'\\033[1;33m'\n");
            out.push_str("C_OFF=$'\\033[0m'\n");
            out.push_str("say()  { printf '%s==>%s %s\\n' \"$C_INFO\" \"$C_OFF\" \"$*\"; }\n");
            out.push_str(
                "warn() { printf '%s==> WARNING:%s %s\\n' \"$C_WARN\" \"$C_OFF\" \"$*\" >&2; }\n",
            );
        } else {
            out.push_str("say()  { printf '==> %s\\n' \"$*\"; }\n");
            out.push_str("warn() { printf '==> WARNING: %s\\n' \"$*\" >&2; }\n");
        }
        out.push('\n');
    }

    fn render_instruction(&self, instruction: &Instruction, out: &mut String) {
        match instruction {
            Instruction::RequireRoot => {
                out.push_str("if [ \"$(id -u)\" -ne 0 ]; then\n");
                out.push_str("    warn 'this script must run as root'\n");
                out.push_str("    exit 1\nfi\n\n");
            }
            Instruction::ToolCheck { tools } => {
                out.push_str(&format!(
                    "for tool in {}; do\n",
                    tools
                        .iter()
                        .map(|t| sh_quote(t))
                        .collect::<Vec<_>>()
                        .join(" ")
                ));
                out.push_str("    if ! command -v \"$tool\" >/dev/null 2>&1; then\n");
                out.push_str("        warn \"required tool not found: $tool\"\n");
                out.push_str("        exit 1\n    fi\ndone\n\n");
            }
            Instruction::DebugInfo => {
                out.push_str("say 'block device layout:'\n");
                out.push_str("lsblk -o NAME,FSTYPE,UUID,MOUNTPOINT || true\n\n");
            }
            Instruction::Trap => {
                out.push_str("MOUNTED=()\n");
                out.push_str("cleanup() {\n");
                out.push_str("    local status=$?\n");
                out.push_str("    if [ \"$status\" -ne 0 ] && [ \"${#MOUNTED[@]}\" -gt 0 ]; then\n");
                out.push_str("        warn 'failure detected, unmounting in reverse order'\n");
                out.push_str("        for ((i=${#MOUNTED[@]}-1; i>=0; i--)); do\n");
                out.push_str("            umount \"${MOUNTED[$i]}\" 2>/dev/null || true\n");
                out.push_str("        done\n    fi\n}\n");
                out.push_str("trap cleanup EXIT\n\n");
            }
            Instruction::AssembleRaid => {
                out.push_str("if command -v mdadm >/dev/null 2>&1; then\n");
                out.push_str("    say 'assembling RAID arrays'\n");
                out.push_str("    mdadm --assemble --scan || true\nfi\n\n");
            }
            Instruction::ActivateLvm => {
                out.push_str("if command -v vgchange >/dev/null 2>&1; then\n");
                out.push_str("    say 'activating LVM volume groups'\n");
                out.push_str("    vgchange -ay || true\nfi\n\n");
            }
            Instruction::Unlock {
                device,
                alias,
                timeout,
                tries,
            } => {
                let mapper = format!("/dev/mapper/{}", alias);
                out.push_str(&format!("if [ ! -e {} ]; then\n", sh_quote(&mapper)));
                out.push_str(&format!(
                    "    say {}\n",
                    sh_quote(&format!("unlocking {} as {}", device, alias))
                ));
                out.push_str(&format!(
                    "    cryptsetup open --timeout {} --tries {} {} {}\n",
                    timeout,
                    tries,
                    sh_quote(device),
                    sh_quote(alias)
                ));
                out.push_str("fi\n\n");
            }
            Instruction::Fsck { device } => {
                out.push_str(&format!("fsck -n {} || warn ", sh_quote(device)));
                out.push_str(&sh_quote(&format!("fsck reported issues on {}", device)));
                out.push('\n');
            }
            Instruction::Mount {
                source,
                target,
                fstype,
                options,
            } => {
                let target_expr = mnt_target(target);
                out.push_str(&format!("mkdir -p {}\n", target_expr));
                out.push_str(&format!("if ! mountpoint -q {}; then\n", target_expr));
                out.push_str(&format!(
                    "    say {}\n",
                    sh_quote(&format!("mounting {} on {}", source, target))
                ));
                let mut cmd = String::from("    mount");
                if let Some(fstype) = fstype {
                    cmd.push_str(&format!(" -t {}", sh_quote(fstype)));
                }
                if !options.is_empty() {
                    cmd.push_str(&format!(" -o {}", sh_quote(&options.join(","))));
                }
                cmd.push_str(&format!(" {} {}\n", sh_quote(source), target_expr));
                out.push_str(&cmd);
                out.push_str(&format!("    MOUNTED+=({})\n", target_expr));
                out.push_str("fi\n\n");
            }
            Instruction::BindMount { source, target } => {
                let target_expr = mnt_target(target);
                out.push_str(&format!("mkdir -p {}\n", target_expr));
                out.push_str(&format!("if ! mountpoint -q {}; then\n", target_expr));
                out.push_str(&format!(
                    "    mount --bind {} {}\n",
                    sh_quote(source),
                    target_expr
                ));
                out.push_str(&format!("    MOUNTED+=({})\n", target_expr));
                out.push_str("fi\n\n");
            }
            Instruction::PseudoMount { fstype, target } => {
                let target_expr = mnt_target(target);
                out.push_str(&format!("mkdir -p {}\n", target_expr));
                out.push_str(&format!("if ! mountpoint -q {}; then\n", target_expr));
                out.push_str(&format!(
                    "    mount -t {} {} {}\n",
                    sh_quote(fstype),
                    sh_quote(fstype),
                    target_expr
                ));
                out.push_str(&format!("    MOUNTED+=({})\n", target_expr));
                out.push_str("fi\n\n");
            }
            Instruction::CopyResolvConf => {
                out.push_str("if [ -f /etc/resolv.conf ] && [ -d \"$MNT/etc\" ]; then\n");
                out.push_str("    cp -L /etc/resolv.conf \"$MNT/etc/resolv.conf\" || \\\n");
                out.push_str("        warn 'could not copy resolv.conf'\nfi\n\n");
            }
            Instruction::Hook { phase } => {
                let name = match phase {
                    HookPhase::PreMount => "pre",
                    HookPhase::PostMount => "post",
                };
                out.push_str(&format!(
                    "if [ -d /etc/autochroot/hooks.d ]; then\n    for hook in /etc/autochroot/hooks.d/{}-*.sh; do\n",
                    name
                ));
                out.push_str("        [ -r \"$hook\" ] || continue\n");
                out.push_str("        say \"running hook $hook\"\n");
                out.push_str("        . \"$hook\"\n    done\nfi\n\n");
            }
            Instruction::Chroot => {
                out.push_str("say \"entering chroot at $MNT\"\n");
                out.push_str("trap - EXIT\n");
                out.push_str("if command -v arch-chroot >/dev/null 2>&1; then\n");
                out.push_str("    exec arch-chroot \"$MNT\"\n");
                out.push_str("else\n");
                out.push_str("    exec chroot \"$MNT\" /bin/bash\nfi\n");
            }
        }
    }
}

fn pseudo_instruction(pseudo: PseudoFs) -> Instruction {
    match pseudo.bind_source() {
        Some(source) => Instruction::BindMount {
            source: source.to_string(),
            target: format!("/{}", pseudo.target()),
        },
        None => Instruction::PseudoMount {
            fstype: pseudo
                .fstype()
                .expect("non-bind pseudo has fstype")
                .to_string(),
            target: format!("/{}", pseudo.target()),
        },
    }
}

/// Single-quote a string for the shell. Embedded single quotes become the
/// standard `'\''` sequence. Always quotes, so output shape is predictable.
pub fn sh_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Target expression below the mount root: `"/"` is `"$MNT"`, `"/boot"` is
/// `"$MNT"'/boot'`.
fn mnt_target(mount_point: &str) -> String {
    if mount_point == "/" {
        "\"$MNT\"".to_string()
    } else {
        format!("\"$MNT\"{}", sh_quote(mount_point))
    }
}
