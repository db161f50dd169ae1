//! Compile/load of the rewritten instrumentation program and typed access to
//! the maps it exports.
//!
//! User space only writes the model-parameter tables, and only during model
//! publication; everything else is read-only from this side.

use anyhow::{anyhow, bail, Context, Result};
use aya::maps::perf::{PerfEventArray, PerfEventArrayBuffer};
use aya::maps::{Array, HashMap, Map, MapData};
use aya::util::online_cpus;
use aya::{Ebpf, EbpfLoader};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use finelame_common::{maps, OutlierScores, RequestFingerprint};

use crate::config::RidType;

#[repr(transparent)]
#[derive(Copy, Clone)]
struct FingerprintRow(RequestFingerprint);

// SAFETY: RequestFingerprint is #[repr(C)] with no padding and derives
// bytemuck::Pod against the same layout the map exports.
unsafe impl aya::Pod for FingerprintRow {}

#[repr(transparent)]
#[derive(Copy, Clone)]
struct ScoreRow(OutlierScores);

// SAFETY: as above.
unsafe impl aya::Pod for ScoreRow {}

/// Compile the rewritten template to BPF bytecode. The object lands next to
/// the source with an `.o` extension.
pub fn compile_program(src: &Path) -> Result<PathBuf> {
    let clang =
        which::which("clang").context("clang is required to build the instrumentation program")?;
    let object = src.with_extension("o");

    let output = Command::new(clang)
        .args(["-g", "-O2", "-target", "bpf", "-c"])
        .arg(src)
        .arg("-o")
        .arg(&object)
        .output()
        .with_context(|| format!("failed to run clang on {}", src.display()))?;

    if !output.status.success() {
        bail!(
            "clang rejected {}: {}",
            src.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!("compiled instrumentation program into {}", object.display());
    Ok(object)
}

/// The loaded instrumentation program and its maps.
pub struct DataPlane {
    bpf: Ebpf,
    rid_type: RidType,
}

impl DataPlane {
    pub fn load(object: &Path, rid_type: RidType) -> Result<Self> {
        let bytes = fs::read(object)
            .with_context(|| format!("failed to read BPF object {}", object.display()))?;
        let bpf = EbpfLoader::new()
            .load(&bytes)
            .context("instrumentation program rejected by the kernel")?;
        Ok(Self { bpf, rid_type })
    }

    pub fn bpf_mut(&mut self) -> &mut Ebpf {
        &mut self.bpf
    }

    fn map(&self, name: &str) -> Result<&Map> {
        self.bpf
            .map(name)
            .ok_or_else(|| anyhow!("{name} map not found in the instrumentation program"))
    }

    fn map_mut(&mut self, name: &str) -> Result<&mut Map> {
        self.bpf
            .map_mut(name)
            .ok_or_else(|| anyhow!("{name} map not found in the instrumentation program"))
    }

    /// Snapshot of the per-request fingerprint table. Request ids are
    /// widened to their raw 64-bit representation.
    pub fn fingerprints(&self) -> Result<Vec<(u64, RequestFingerprint)>> {
        let map = self.map(maps::DATAPOINTS)?;
        let mut rows = Vec::new();
        match self.rid_type {
            RidType::U32 => {
                let view = HashMap::<_, u32, FingerprintRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid as u64, row.0));
                }
            }
            RidType::U64 => {
                let view = HashMap::<_, u64, FingerprintRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid, row.0));
                }
            }
            RidType::Int => {
                let view = HashMap::<_, i32, FingerprintRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid as u32 as u64, row.0));
                }
            }
        }
        Ok(rows)
    }

    /// Snapshot of the per-request scoring table.
    pub fn outlier_scores(&self) -> Result<Vec<(u64, OutlierScores)>> {
        let map = self.map(maps::OUTLIER_SCORES)?;
        let mut rows = Vec::new();
        match self.rid_type {
            RidType::U32 => {
                let view = HashMap::<_, u32, ScoreRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid as u64, row.0));
                }
            }
            RidType::U64 => {
                let view = HashMap::<_, u64, ScoreRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid, row.0));
                }
            }
            RidType::Int => {
                let view = HashMap::<_, i32, ScoreRow>::try_from(map)?;
                for entry in view.iter() {
                    let (rid, row) = entry?;
                    rows.push((rid as u32 as u64, row.0));
                }
            }
        }
        Ok(rows)
    }

    fn read_array<V: aya::Pod>(&self, name: &str, len: usize) -> Result<Vec<V>> {
        let array = Array::<_, V>::try_from(self.map(name)?)?;
        (0..len)
            .map(|i| {
                array
                    .get(&(i as u32), 0)
                    .with_context(|| format!("failed to read {name}[{i}]"))
            })
            .collect()
    }

    fn write_array_slot<V: aya::Pod>(&mut self, name: &str, index: u32, value: V) -> Result<()> {
        let mut array = Array::<_, V>::try_from(self.map_mut(name)?)?;
        array
            .set(index, value, 0)
            .with_context(|| format!("failed to write {name}[{index}]"))
    }

    /// Packed `(mean, std)` pairs; `2 * features` entries.
    pub fn read_train_params(&self, features: usize) -> Result<Vec<u64>> {
        self.read_array(maps::TRAIN_SET_PARAMS, 2 * features)
    }

    pub fn set_train_param(&mut self, index: u32, value: u64) -> Result<()> {
        self.write_array_slot(maps::TRAIN_SET_PARAMS, index, value)
    }

    pub fn set_centroid_offset(&mut self, value: u64) -> Result<()> {
        self.write_array_slot(maps::CENTROID_OFFSET, 0, value)
    }

    pub fn read_centroid_l1s(&self, clusters: usize) -> Result<Vec<i64>> {
        self.read_array(maps::CENTROID_L1S, clusters)
    }

    pub fn set_centroid_l1(&mut self, cluster: u32, value: i64) -> Result<()> {
        self.write_array_slot(maps::CENTROID_L1S, cluster, value)
    }

    pub fn read_cluster_thresholds(&self, clusters: usize) -> Result<Vec<u64>> {
        self.read_array(maps::CLUSTER_THRESHOLDS, clusters)
    }

    pub fn set_cluster_threshold(&mut self, cluster: u32, value: u64) -> Result<()> {
        self.write_array_slot(maps::CLUSTER_THRESHOLDS, cluster, value)
    }

    /// Open one diagnostics perf buffer per online CPU. Consumes the map.
    pub fn notification_buffers(&mut self) -> Result<Vec<PerfEventArrayBuffer<MapData>>> {
        let map = self
            .bpf
            .take_map(maps::NOTIFICATION_EVT)
            .ok_or_else(|| anyhow!("{} map not found", maps::NOTIFICATION_EVT))?;
        let mut array = PerfEventArray::try_from(map)?;
        let mut buffers = Vec::new();
        for cpu in online_cpus().map_err(|(_, err)| err)? {
            buffers.push(array.open(cpu, None)?);
        }
        Ok(buffers)
    }
}
