//! Offline half of the anomaly detector: training-set management, feature
//! standardization, threshold derivation, and ordered publication of the
//! fitted model into the data plane.

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use rand::Rng;

use finelame_common::RequestFingerprint;

use crate::config::{ModelParams, RequestStat};
use crate::dataplane::DataPlane;
use crate::kmeans::{self, KMeansModel};
use crate::scale::{ScalingPolicy, DEFAULT_M_SCALE, DEFAULT_S_SCALE};

/// Percentile above which training rows are trimmed before fitting.
pub const PCT_TRAIN_CLEAN: f64 = 99.99;

/// Outlier thresholds sit this many in-cluster standard deviations above the
/// mean L1 norm.
const THRESHOLD_STDEVS: f64 = 5.0;

/// One sampled fingerprint, with its counters resolved into the configured
/// feature order.
#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub rid: u64,
    pub origin_ip: u64,
    pub origin_ts: u64,
    pub completion_ts: u64,
    pub counters: Vec<u64>,
}

/// A snapshot of the fingerprint table, one column per `request_stats`
/// entry.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub columns: Vec<String>,
    pub rows: Vec<TrainingRow>,
}

impl TrainingSet {
    pub fn from_snapshot(
        stats: &[RequestStat],
        snapshot: &[(u64, RequestFingerprint)],
    ) -> Result<Self> {
        let columns = stats.iter().map(|s| s.name.clone()).collect();
        let rows = snapshot
            .iter()
            .map(|(rid, fp)| {
                let counters = stats
                    .iter()
                    .map(|stat| {
                        fp.counter(&stat.datapoint).ok_or_else(|| {
                            anyhow!("unknown fingerprint field {}", stat.datapoint)
                        })
                    })
                    .collect::<Result<Vec<u64>>>()?;
                Ok(TrainingRow {
                    rid: *rid,
                    origin_ip: fp.origin_ip,
                    origin_ts: fp.origin_ts,
                    completion_ts: fp.completion_ts,
                    counters,
                })
            })
            .collect::<Result<Vec<TrainingRow>>>()?;
        Ok(Self { columns, rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop every row whose value in one of the given columns exceeds that
    /// column's `pct` percentile. Cutoffs are computed on the table as
    /// sampled, so the post-cleaning maximum of each column never exceeds
    /// its pre-cleaning percentile.
    pub fn clean_above_percentile(&mut self, columns: &[usize], pct: f64) {
        if self.rows.is_empty() {
            return;
        }
        let cutoffs: Vec<(usize, f64)> = columns
            .iter()
            .map(|&c| {
                let values: Vec<f64> = self.rows.iter().map(|r| r.counters[c] as f64).collect();
                (c, percentile(&values, pct))
            })
            .collect();
        self.rows.retain(|row| {
            cutoffs
                .iter()
                .all(|(c, cutoff)| row.counters[*c] as f64 <= *cutoff)
        });
    }
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (len - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Per-feature standardization parameters fitted on the training matrix.
#[derive(Debug, Clone)]
pub struct Standardizer {
    pub means: Vec<f64>,
    /// Divisors; a zero standard deviation is stored as 1.0 so constant
    /// features pass through centered.
    pub stdevs: Vec<f64>,
}

impl Standardizer {
    pub fn fit(matrix: &[Vec<f64>]) -> Self {
        let width = matrix.first().map(Vec::len).unwrap_or(0);
        let mut means = Vec::with_capacity(width);
        let mut stdevs = Vec::with_capacity(width);
        for c in 0..width {
            let column: Vec<f64> = matrix.iter().map(|row| row[c]).collect();
            let m = mean(&column);
            let s = population_std(&column, m);
            means.push(m);
            stdevs.push(if s == 0.0 { 1.0 } else { s });
        }
        Self { means, stdevs }
    }

    pub fn transform(&self, matrix: &[Vec<f64>]) -> Vec<Vec<f64>> {
        matrix
            .iter()
            .map(|row| {
                row.iter()
                    .zip(self.means.iter().zip(&self.stdevs))
                    .map(|(value, (m, s))| (value - m) / s)
                    .collect()
            })
            .collect()
    }
}

/// Everything one training pass publishes, in data-plane integer form.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    /// Packed `(mean, std)` pairs, scaled: `2 * features` entries.
    pub train_params: Vec<u64>,
    pub centroid_offset: u64,
    pub centroid_l1s: Vec<i64>,
    pub cluster_thresholds: Vec<u64>,
    pub standardizer: Standardizer,
    pub model: KMeansModel,
}

pub struct Detector {
    pub k: usize,
    pub features: Vec<String>,
    pub policy: ScalingPolicy,
    train_set: Option<TrainingSet>,
}

impl Detector {
    pub fn new(params: &ModelParams) -> Self {
        info!(
            "configuring anomaly detector (k = {}, {} features)",
            params.k,
            params.features.len()
        );
        let policy = ScalingPolicy::new(
            params.scale_method,
            params.m_scale.unwrap_or(DEFAULT_M_SCALE),
            params.s_scale.unwrap_or(DEFAULT_S_SCALE),
        );
        Self {
            k: params.k,
            features: params.features.clone(),
            policy,
            train_set: None,
        }
    }

    pub fn train_set(&self) -> Option<&TrainingSet> {
        self.train_set.as_ref()
    }

    /// Adopt a snapshot as the training set, trimming the heaviest tail of
    /// every feature column unless `do_clean` is off.
    pub fn set_train_data(&mut self, mut set: TrainingSet, do_clean: bool) -> Result<()> {
        let indices = self.feature_indices(&set)?;
        if do_clean {
            let before = set.rows.len();
            set.clean_above_percentile(&indices, PCT_TRAIN_CLEAN);
            info!(
                "cleaned training set: {} of {before} rows kept",
                set.rows.len()
            );
        }
        self.train_set = Some(set);
        Ok(())
    }

    fn feature_indices(&self, set: &TrainingSet) -> Result<Vec<usize>> {
        self.features
            .iter()
            .map(|feature| {
                set.columns
                    .iter()
                    .position(|c| c == feature)
                    .ok_or_else(|| anyhow!("model feature {feature} missing from snapshot"))
            })
            .collect()
    }

    /// Standardize, fit k-means, and derive the scaled integer tables
    /// without touching the data plane.
    pub fn derive_model<R: Rng>(&self, rng: &mut R) -> Result<ModelArtifacts> {
        let set = self
            .train_set
            .as_ref()
            .ok_or_else(|| anyhow!("no training data collected"))?;
        if set.rows.len() < self.k {
            bail!(
                "cannot fit {} clusters to {} training rows",
                self.k,
                set.rows.len()
            );
        }
        let indices = self.feature_indices(set)?;
        let matrix: Vec<Vec<f64>> = set
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row.counters[i] as f64).collect())
            .collect();

        let standardizer = Standardizer::fit(&matrix);
        let mut train_params = Vec::with_capacity(2 * self.features.len());
        for (i, feature) in self.features.iter().enumerate() {
            let mean = standardizer.means[i];
            let std = standardizer.stdevs[i];
            info!("appending mean {mean} and std {std} for feature {feature}");
            train_params.push(self.policy.means.to_unsigned(mean));
            train_params.push(self.policy.stdevs.to_unsigned(std));
        }

        let z = standardizer.transform(&matrix);
        let model = kmeans::fit(&z, self.k, kmeans::MAX_ITERATIONS, kmeans::TOLERANCE, rng)?;
        info!("trained k-means model in {} iterations", model.iterations);

        let c_scale = self.policy.centroid_factor();
        let offset: f64 = standardizer
            .means
            .iter()
            .zip(&standardizer.stdevs)
            .map(|(m, s)| m / s)
            .sum();
        let centroid_offset = (offset * c_scale).round() as u64;

        let mut centroid_l1s = Vec::with_capacity(self.k);
        let mut cluster_thresholds = Vec::with_capacity(self.k);
        for cluster in 0..self.k {
            let sums: Vec<f64> = z
                .iter()
                .zip(&model.labels)
                .filter(|(_, &label)| label == cluster)
                .map(|(row, _)| row.iter().sum())
                .collect();
            let threshold = if sums.is_empty() {
                warn!("cluster {cluster} has no members; threshold forced to 0");
                0.0
            } else {
                let l1_mean = mean(&sums);
                let l1_std = population_std(&sums, l1_mean);
                (l1_mean + THRESHOLD_STDEVS * l1_std).abs() * c_scale
            };
            let l1: f64 = model.centroids[cluster].iter().sum::<f64>() * c_scale;
            info!("cluster {cluster}: centroid l1 {l1:.3}, scaled threshold {threshold:.3}");
            centroid_l1s.push(l1.round() as i64);
            cluster_thresholds.push(threshold.round() as u64);
        }

        Ok(ModelArtifacts {
            train_params,
            centroid_offset,
            centroid_l1s,
            cluster_thresholds,
            standardizer,
            model,
        })
    }

    /// Fit the model and push it into the data plane. Writes are ordered:
    /// standardization parameters and the offset first, centroid L1s next,
    /// thresholds last — a non-zero threshold is the kernel side's readiness
    /// signal.
    pub fn train_and_publish<R: Rng>(
        &self,
        plane: &mut DataPlane,
        rng: &mut R,
    ) -> Result<ModelArtifacts> {
        info!("training and sharing the model");
        let artifacts = self.derive_model(rng)?;

        for (i, value) in artifacts.train_params.iter().enumerate() {
            plane.set_train_param(i as u32, *value)?;
        }
        plane.set_centroid_offset(artifacts.centroid_offset)?;
        for (cluster, l1) in artifacts.centroid_l1s.iter().enumerate() {
            plane.set_centroid_l1(cluster as u32, *l1)?;
        }
        for (cluster, threshold) in artifacts.cluster_thresholds.iter().enumerate() {
            plane.set_cluster_threshold(cluster as u32, *threshold)?;
        }
        info!("published model parameters to the data plane");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::ScaleMethod;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn stats() -> Vec<RequestStat> {
        vec![
            RequestStat {
                name: "cputime".to_string(),
                datapoint: "cputime".to_string(),
            },
            RequestStat {
                name: "allocs".to_string(),
                datapoint: "allocs".to_string(),
            },
        ]
    }

    fn params(k: usize) -> ModelParams {
        ModelParams {
            k,
            features: vec!["cputime".to_string(), "allocs".to_string()],
            scale_method: ScaleMethod::Exponent,
            m_scale: Some(10),
            s_scale: Some(6),
        }
    }

    fn two_cluster_snapshot(n: usize) -> Vec<(u64, RequestFingerprint)> {
        let mut snapshot = Vec::new();
        for i in 0..n {
            let jitter = (i % 7) as u64;
            let mut fp = RequestFingerprint {
                origin_ts: 100 + i as u64,
                completion_ts: 200 + i as u64,
                origin_ip: 0xdead,
                ..Default::default()
            };
            if i % 2 == 0 {
                fp.cputime = 100 + jitter;
                fp.allocs = 50 + jitter;
            } else {
                fp.cputime = 10_000 + jitter;
                fp.allocs = 5_000 + jitter;
            }
            snapshot.push((i as u64, fp));
        }
        snapshot
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 100.0);
        assert!((percentile(&values, 50.0) - 50.5).abs() < 1e-9);
        assert_eq!(percentile(&[42.0], 99.99), 42.0);
    }

    #[test]
    fn cleaning_never_exceeds_the_pre_cleaning_percentile() {
        let stats = stats();
        let mut snapshot = two_cluster_snapshot(200);
        // one extreme outlier per column
        snapshot.push((
            9999,
            RequestFingerprint {
                cputime: 10_000_000,
                allocs: 9_000_000,
                ..Default::default()
            },
        ));
        let mut set = TrainingSet::from_snapshot(&stats, &snapshot).unwrap();

        let cutoffs: Vec<f64> = (0..2)
            .map(|c| {
                let values: Vec<f64> = set.rows.iter().map(|r| r.counters[c] as f64).collect();
                percentile(&values, PCT_TRAIN_CLEAN)
            })
            .collect();

        set.clean_above_percentile(&[0, 1], PCT_TRAIN_CLEAN);
        assert!(!set.rows.is_empty());
        for (c, cutoff) in cutoffs.iter().enumerate() {
            let max = set
                .rows
                .iter()
                .map(|r| r.counters[c] as f64)
                .fold(0.0, f64::max);
            assert!(max <= *cutoff, "column {c}: max {max} above cutoff {cutoff}");
        }
    }

    #[test]
    fn standardizer_centers_and_scales() {
        let matrix = vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0]];
        let standardizer = Standardizer::fit(&matrix);
        assert!((standardizer.means[0] - 3.0).abs() < 1e-9);
        // constant column keeps a unit divisor
        assert_eq!(standardizer.stdevs[1], 1.0);

        let z = standardizer.transform(&matrix);
        let col0_mean = mean(&z.iter().map(|r| r[0]).collect::<Vec<_>>());
        assert!(col0_mean.abs() < 1e-9);
        let col0_std = population_std(&z.iter().map(|r| r[0]).collect::<Vec<_>>(), 0.0);
        assert!((col0_std - 1.0).abs() < 1e-9);
        assert!(z.iter().all(|r| r[1] == 0.0));
    }

    #[test]
    fn train_params_round_trip_through_the_scales() {
        let mut detector = Detector::new(&params(2));
        let set = TrainingSet::from_snapshot(&stats(), &two_cluster_snapshot(100)).unwrap();
        detector.set_train_data(set, true).unwrap();
        let artifacts = detector
            .derive_model(&mut StdRng::seed_from_u64(11))
            .unwrap();

        for (i, _feature) in detector.features.iter().enumerate() {
            let mean = artifacts.standardizer.means[i];
            let std = artifacts.standardizer.stdevs[i];
            let recovered_mean = detector.policy.means.recover(artifacts.train_params[2 * i]);
            let recovered_std = detector
                .policy
                .stdevs
                .recover(artifacts.train_params[2 * i + 1]);
            assert!((recovered_mean - mean).abs() <= 1.0 / detector.policy.means.factor());
            assert!((recovered_std - std).abs() <= 1.0 / detector.policy.stdevs.factor());
        }
    }

    #[test]
    fn separated_clusters_yield_distinct_l1s_and_positive_thresholds() {
        let mut detector = Detector::new(&params(2));
        let set = TrainingSet::from_snapshot(&stats(), &two_cluster_snapshot(1000)).unwrap();
        detector.set_train_data(set.clone(), true).unwrap();
        let artifacts = detector
            .derive_model(&mut StdRng::seed_from_u64(5))
            .unwrap();

        assert_ne!(artifacts.centroid_l1s[0], artifacts.centroid_l1s[1]);
        assert!(artifacts.cluster_thresholds.iter().all(|&t| t > 0));

        // the ordering of the published L1s matches the label-derived
        // mean row sums of the standardized training data
        let matrix: Vec<Vec<f64>> = set
            .rows
            .iter()
            .map(|r| r.counters.iter().map(|&v| v as f64).collect())
            .collect();
        let z = artifacts.standardizer.transform(&matrix);
        let label_sums: Vec<f64> = (0..2)
            .map(|cluster| {
                let sums: Vec<f64> = z
                    .iter()
                    .zip(&artifacts.model.labels)
                    .filter(|(_, &label)| label == cluster)
                    .map(|(row, _)| row.iter().sum())
                    .collect();
                mean(&sums)
            })
            .collect();
        assert_eq!(
            artifacts.centroid_l1s[0] < artifacts.centroid_l1s[1],
            label_sums[0] < label_sums[1]
        );
    }

    #[test]
    fn scale_methods_agree_on_cluster_ordering() {
        let snapshot = two_cluster_snapshot(400);
        let set = TrainingSet::from_snapshot(&stats(), &snapshot).unwrap();

        let mut exponent_params = params(2);
        exponent_params.m_scale = Some(3);
        exponent_params.s_scale = Some(0);
        let mut exponent = Detector::new(&exponent_params);
        exponent.set_train_data(set.clone(), true).unwrap();
        let a = exponent
            .derive_model(&mut StdRng::seed_from_u64(9))
            .unwrap();

        let mut bitshift_params = params(2);
        bitshift_params.scale_method = ScaleMethod::Bitshift;
        bitshift_params.m_scale = Some(10);
        let mut bitshift = Detector::new(&bitshift_params);
        bitshift.set_train_data(set, true).unwrap();
        let b = bitshift
            .derive_model(&mut StdRng::seed_from_u64(9))
            .unwrap();

        assert_ne!(a.centroid_l1s, b.centroid_l1s);
        assert_eq!(
            a.centroid_l1s[0] < a.centroid_l1s[1],
            b.centroid_l1s[0] < b.centroid_l1s[1]
        );
    }

    #[test]
    fn more_clusters_than_rows_is_an_error() {
        let mut detector = Detector::new(&params(2));
        let set = TrainingSet::from_snapshot(&stats(), &two_cluster_snapshot(1)).unwrap();
        detector.set_train_data(set, false).unwrap();
        assert!(detector.derive_model(&mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn snapshot_rejects_unknown_datapoint_fields() {
        let bad = vec![RequestStat {
            name: "rss".to_string(),
            datapoint: "resident_pages".to_string(),
        }];
        let snapshot = two_cluster_snapshot(2);
        assert!(TrainingSet::from_snapshot(&bad, &snapshot).is_err());
    }
}
