//! The mode machine driving a run: train (optionally), hand scoring to the
//! data plane, and dump artifacts on shutdown.
//!
//! One `tick` per second; the data plane does everything else concurrently
//! from probe context.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};

use crate::artifacts::{self, ArtifactConfig};
use crate::config::{RequestStat, RidType};
use crate::dataplane::DataPlane;
use crate::detector::{Detector, TrainingSet};
use crate::probes::ProbeSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Collecting fingerprints for the model; anomaly-detection runs start
    /// here.
    Training,
    /// Passive collection only; runs without anomaly detection stay here
    /// until shutdown.
    Monitoring,
    /// Model published; the data plane scores every completed request.
    Detection,
    Stopped,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Training => "training",
            Mode::Monitoring => "monitoring",
            Mode::Detection => "detection",
            Mode::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct Pipeline {
    mode: Mode,
    start_ts: Instant,
    train_time: Option<Duration>,
    detector: Option<Detector>,
    plane: DataPlane,
    supervisor: ProbeSupervisor,
    request_stats: Vec<RequestStat>,
    rid_type: RidType,
}

impl Pipeline {
    pub fn new(
        plane: DataPlane,
        supervisor: ProbeSupervisor,
        detector: Option<Detector>,
        train_time: Option<Duration>,
        request_stats: Vec<RequestStat>,
        rid_type: RidType,
    ) -> Self {
        let mode = if detector.is_some() {
            Mode::Training
        } else {
            Mode::Monitoring
        };
        Self {
            mode,
            start_ts: Instant::now(),
            train_time,
            detector,
            plane,
            supervisor,
            request_stats,
            rid_type,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// One control-loop iteration. In training mode, checks whether the
    /// window has elapsed and, with a non-empty snapshot, fits and publishes
    /// the model. Errors are transient (the caller logs and keeps looping).
    pub fn tick<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        if self.mode != Mode::Training {
            return Ok(());
        }
        let Some(train_time) = self.train_time else {
            return Ok(());
        };
        if self.start_ts.elapsed() < train_time {
            return Ok(());
        }

        let snapshot = self.plane.fingerprints()?;
        let set = TrainingSet::from_snapshot(&self.request_stats, &snapshot)?;
        if set.is_empty() {
            info!("did not record any data; resetting training timer");
            self.start_ts = Instant::now();
            return Ok(());
        }

        let detector = self
            .detector
            .as_mut()
            .ok_or_else(|| anyhow!("training mode without a detector"))?;
        detector.set_train_data(set, true)?;
        match detector.train_and_publish(&mut self.plane, rng) {
            Ok(_) => {
                info!("model published; entering detection mode");
                self.mode = Mode::Detection;
            }
            Err(err) => {
                error!("training failed: {err:#}; resetting training timer");
                self.start_ts = Instant::now();
            }
        }
        Ok(())
    }

    /// Detach every probe (LIFO) and dump the artifacts the current mode
    /// accumulated. All dumps are best-effort.
    pub fn shutdown(&mut self, sink: &ArtifactConfig) {
        info!("stopping finelame");
        {
            let Self {
                plane, supervisor, ..
            } = self;
            supervisor.detach_all(plane.bpf_mut());
        }

        match self.mode {
            Mode::Monitoring => match self.snapshot_table() {
                Ok(set) if set.is_empty() => info!("did not record any data"),
                Ok(set) => info!("recorded {} request fingerprints", set.rows.len()),
                Err(err) => warn!("failed to read fingerprints: {err:#}"),
            },
            Mode::Training | Mode::Detection => self.dump_training_artifacts(sink),
            Mode::Stopped => {}
        }
        if self.mode == Mode::Detection {
            self.dump_detection_artifacts(sink);
        }
        self.mode = Mode::Stopped;
    }

    fn snapshot_table(&self) -> Result<TrainingSet> {
        let snapshot = self.plane.fingerprints()?;
        TrainingSet::from_snapshot(&self.request_stats, &snapshot)
    }

    fn dump_training_artifacts(&self, sink: &ArtifactConfig) {
        let Some(set) = self.detector.as_ref().and_then(Detector::train_set) else {
            return;
        };
        let path = sink.path("train", "csv");
        info!("dumping train data into {}", path.display());
        if let Err(err) = artifacts::dump_rows_csv(&path, set, self.rid_type) {
            warn!("failed to write {}: {err:#}", path.display());
        }
    }

    fn dump_detection_artifacts(&self, sink: &ArtifactConfig) {
        let Some(detector) = self.detector.as_ref() else {
            return;
        };
        let k = detector.k;
        let features = &detector.features;

        match self.snapshot_table() {
            Ok(set) if !set.is_empty() => {
                let path = sink.path("test", "csv");
                info!("dumping test data into {}", path.display());
                if let Err(err) = artifacts::dump_rows_csv(&path, &set, self.rid_type) {
                    warn!("failed to write {}: {err:#}", path.display());
                }
            }
            Ok(_) => info!("no test datapoints recorded"),
            Err(err) => warn!("failed to read test datapoints: {err:#}"),
        }

        let path = sink.path("scores", "csv");
        info!("gathering outlier scores into {}", path.display());
        match self.plane.outlier_scores() {
            Ok(scores) => {
                if let Err(err) = artifacts::dump_scores_csv(&path, &scores, k, self.rid_type) {
                    warn!("failed to write {}: {err:#}", path.display());
                }
            }
            Err(err) => warn!("failed to read outlier scores: {err:#}"),
        }

        let path = sink.path("normalization", "csv");
        info!("gathering normalization data into {}", path.display());
        match self.plane.read_train_params(features.len()) {
            Ok(params) => {
                if let Err(err) = artifacts::dump_normalization_csv(&path, features, &params) {
                    warn!("failed to write {}: {err:#}", path.display());
                }
                let path = sink.path("model_params", "csv");
                info!("gathering model parameters into {}", path.display());
                match self.plane.read_cluster_thresholds(k) {
                    Ok(thresholds) => {
                        if let Err(err) =
                            artifacts::dump_model_params_csv(&path, &params, &thresholds)
                        {
                            warn!("failed to write {}: {err:#}", path.display());
                        }
                    }
                    Err(err) => warn!("failed to read cluster thresholds: {err:#}"),
                }
            }
            Err(err) => warn!("failed to read normalization parameters: {err:#}"),
        }

        let path = sink.path("clusters", "csv");
        info!("gathering cluster data into {}", path.display());
        match (
            self.plane.read_centroid_l1s(k),
            self.plane.read_cluster_thresholds(k),
        ) {
            (Ok(l1s), Ok(thresholds)) => {
                if let Err(err) = artifacts::dump_clusters_csv(&path, &l1s, &thresholds) {
                    warn!("failed to write {}: {err:#}", path.display());
                }
            }
            (Err(err), _) | (_, Err(err)) => warn!("failed to read cluster data: {err:#}"),
        }

        let path = sink.path("fl_cfg", "yml");
        if let Err(err) = artifacts::copy_config(&sink.config_path, &path) {
            warn!("failed to copy configuration to {}: {err:#}", path.display());
        }
    }
}
