//! Macro expansion of the instrumentation program template.
//!
//! The rewriter is purely textual and never parses the program; each
//! placeholder is one entry in a flat substitution pass. The expanded source
//! lands next to the template with a `_rewritten` suffix and the original
//! extension.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RidType;
use crate::scale::FixedScale;

pub const REWRITTEN_SUFFIX: &str = "_rewritten";

/// Everything the template substitutions draw from.
pub struct TemplateSubstitutions {
    /// `$DEBUG_PRINTK` becomes the printk built-in when set, the `IGNORE`
    /// no-op otherwise.
    pub debug: bool,
    /// Cluster count for `$K`; absent on monitoring-only runs, which skips
    /// the model macros entirely.
    pub clusters: Option<usize>,
    /// Mean scaler for `$MSCALE(expr)`; absent on monitoring-only runs.
    pub m_scale: Option<FixedScale>,
    pub rid_type: RidType,
    /// `(entry probe fn_name, rid argument position)` per application
    /// monitor; each `$<fn_name>` token becomes the position.
    pub rid_positions: Vec<(String, u32)>,
}

/// Expand `src_file` and write the result next to it.
pub fn rewrite_template(src_file: &Path, subs: &TemplateSubstitutions) -> Result<PathBuf> {
    let src = fs::read_to_string(src_file)
        .with_context(|| format!("failed to read template {}", src_file.display()))?;

    let rewritten = apply(&src, subs)?;

    let dst_file = rewritten_path(src_file);
    fs::write(&dst_file, rewritten)
        .with_context(|| format!("failed to write rewritten program {}", dst_file.display()))?;
    Ok(dst_file)
}

/// Apply every substitution, in the documented order, to the template text.
pub fn apply(src: &str, subs: &TemplateSubstitutions) -> Result<String> {
    let mut text = src.replace(
        "$DEBUG_PRINTK",
        if subs.debug { "bpf_trace_printk" } else { "IGNORE" },
    );

    if let Some(k) = subs.clusters {
        text = text.replace("$K", &k.to_string());
    }
    if let Some(scale) = &subs.m_scale {
        text = splice_mscale(&text, &scale.splice_text())?;
    }

    text = text.replace("$RID_TYPE", subs.rid_type.c_type());
    text = text.replace("$REQ_TYPE_FORMAT", subs.rid_type.printf_conversion());

    for (fn_name, position) in &subs.rid_positions {
        text = text.replace(&format!("${fn_name}"), &position.to_string());
    }

    Ok(text)
}

/// Rewrite each `$MSCALE(expr)` into `(expr)` followed by the multiplier
/// text. The insertion goes after the first closing parenthesis of the
/// occurrence; the macro name is then dropped.
fn splice_mscale(src: &str, insertion: &str) -> Result<String> {
    let mut text = src.to_string();
    while let Some(start) = text.find("$MSCALE(") {
        let close = match text[start..].find(')') {
            Some(offset) => start + offset,
            None => bail!("unterminated $MSCALE macro in instrumentation template"),
        };
        text.insert_str(close + 1, insertion);
        text = text.replacen("$MSCALE", "", 1);
    }
    Ok(text)
}

/// `foo.c` -> `foo_rewritten.c`; extension-less inputs get the bare suffix.
fn rewritten_path(src_file: &Path) -> PathBuf {
    let stem = src_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match src_file.extension() {
        Some(ext) => format!("{stem}{REWRITTEN_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{REWRITTEN_SUFFIX}"),
    };
    src_file.with_file_name(name)
}
