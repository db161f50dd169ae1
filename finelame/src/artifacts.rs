//! Shutdown CSV artifacts. Every writer is best-effort from the caller's
//! point of view: a failure costs the artifact, not the shutdown.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use finelame_common::OutlierScores;

use crate::config::RidType;
use crate::detector::TrainingSet;

/// Where artifacts go and how they are labelled.
pub struct ArtifactConfig {
    pub outdir: PathBuf,
    pub run_label: String,
    /// The configuration file the run was started with; copied verbatim.
    pub config_path: PathBuf,
}

impl ArtifactConfig {
    pub fn path(&self, prefix: &str, ext: &str) -> PathBuf {
        self.outdir
            .join(format!("{prefix}_{}.{ext}", self.run_label))
    }
}

/// Fingerprint rows (training or test data), one line per request.
pub fn dump_rows_csv(path: &Path, set: &TrainingSet, rid_type: RidType) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    write!(out, "req_id,origin_ip,origin_ts,completion_ts")?;
    for column in &set.columns {
        write!(out, ",{column}")?;
    }
    writeln!(out)?;

    for row in &set.rows {
        write!(
            out,
            "{},{},{},{}",
            rid_type.format_rid(row.rid),
            row.origin_ip,
            row.origin_ts,
            row.completion_ts
        )?;
        for counter in &row.counters {
            write!(out, ",{counter}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Outlier-score rows. `score` is the signed distance whose magnitude is
/// smallest across the `k` clusters.
pub fn dump_scores_csv(
    path: &Path,
    scores: &[(u64, OutlierScores)],
    k: usize,
    rid_type: RidType,
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    write!(
        out,
        "req_id,score,detection_ts,detection_cputime,last_ts,is_outlier"
    )?;
    for i in 0..k {
        write!(out, ",score_{i}")?;
    }
    writeln!(out)?;

    for (rid, row) in scores {
        let (_, score) = row.nearest(k);
        write!(
            out,
            "{},{},{},{},{},{}",
            rid_type.format_rid(*rid),
            score,
            row.detection_ts,
            row.detection_cputime,
            row.last_ts,
            row.is_outlier
        )?;
        for distance in row.distances.iter().take(k) {
            write!(out, ",{distance}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Fixed-point `(mean, std)` per feature, as stored in `train_set_params`.
pub fn dump_normalization_csv(path: &Path, features: &[String], params: &[u64]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "feature,mean,std")?;
    for (i, feature) in features.iter().enumerate() {
        writeln!(out, "{feature},{},{}", params[2 * i], params[2 * i + 1])?;
    }
    out.flush()?;
    Ok(())
}

/// Per-cluster centroid L1 and outlier threshold.
pub fn dump_clusters_csv(path: &Path, l1s: &[i64], thresholds: &[u64]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "l1,threshold")?;
    for (l1, threshold) in l1s.iter().zip(thresholds) {
        writeln!(out, "{l1},{threshold}")?;
    }
    out.flush()?;
    Ok(())
}

/// Raw dump of `train_set_params` followed by one `[kN] value` line per
/// cluster threshold.
pub fn dump_model_params_csv(path: &Path, params: &[u64], thresholds: &[u64]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "{params:?}")?;
    for (k, threshold) in thresholds.iter().enumerate() {
        writeln!(out, "[k{k}] {threshold}")?;
    }
    out.flush()?;
    Ok(())
}

/// Verbatim copy of the run configuration.
pub fn copy_config(config_path: &Path, dst: &Path) -> Result<()> {
    fs::copy(config_path, dst)
        .with_context(|| format!("failed to copy {} to {}", config_path.display(), dst.display()))?;
    Ok(())
}
