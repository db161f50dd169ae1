//! YAML run configuration.
//!
//! Parse failures and validation failures are both fatal at startup; an
//! unknown RID type or probe side never reaches the attach path.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use finelame_common::{RequestFingerprint, MAX_CLUSTERS};

use crate::probes::{ProbeKind, ProbeSide};
use crate::scale::ScaleMethod;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path to the instrumentation program source template.
    pub ebpf_prog: PathBuf,
    pub applications: Vec<ApplicationConfig>,
    #[serde(default)]
    pub resource_monitors: Vec<ResourceMonitorConfig>,
    #[serde(default)]
    pub hardware_monitors: Vec<HardwareMonitorConfig>,
    /// Ordered feature-name -> fingerprint-field mapping. Kept as a raw YAML
    /// mapping because document order defines the feature list.
    #[serde(default)]
    request_stats: serde_yaml::Mapping,
    pub model_params: Option<ModelParams>,
    pub train_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationConfig {
    pub exec_path: PathBuf,
    #[serde(default)]
    pub rid_type: RidType,
    #[serde(default)]
    pub monitors: Vec<AppMonitorConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AppMonitorConfig {
    /// Symbol in the application binary.
    pub event: String,
    pub in_fn_name: Option<String>,
    pub ret_fn_name: Option<String>,
    /// Which probe argument carries the request id.
    #[serde(default = "default_rid_position")]
    pub rid_position: u32,
}

#[derive(Debug, Deserialize)]
pub struct ResourceMonitorConfig {
    pub event: String,
    pub in_fn_name: Option<String>,
    pub ret_fn_name: Option<String>,
    pub side: ProbeSide,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub exec_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct HardwareMonitorConfig {
    /// A `PERF_COUNT_HW_*` counter name, e.g. `CACHE_MISSES`.
    pub event: String,
    pub fn_name: String,
    pub sample_period: Option<u64>,
    /// CPUs to sample on; all online CPUs when absent.
    pub cpus: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelParams {
    pub k: usize,
    pub features: Vec<String>,
    #[serde(default)]
    pub scale_method: ScaleMethod,
    pub m_scale: Option<u32>,
    pub s_scale: Option<u32>,
}

/// Integer width of the application-defined request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RidType {
    #[default]
    #[serde(rename = "u32")]
    U32,
    #[serde(rename = "u64")]
    U64,
    #[serde(rename = "int")]
    Int,
}

impl RidType {
    /// The type token substituted for `$RID_TYPE`.
    pub fn c_type(&self) -> &'static str {
        match self {
            RidType::U32 => "u32",
            RidType::U64 => "u64",
            RidType::Int => "int",
        }
    }

    /// The printf conversion substituted for `$REQ_TYPE_FORMAT`.
    pub fn printf_conversion(&self) -> &'static str {
        match self {
            RidType::U32 => "u",
            RidType::U64 => "lu",
            RidType::Int => "d",
        }
    }

    /// Render a request id carried as raw 64-bit bits at the declared width.
    pub fn format_rid(&self, raw: u64) -> String {
        match self {
            RidType::U32 => (raw as u32).to_string(),
            RidType::U64 => raw.to_string(),
            RidType::Int => (raw as u32 as i32).to_string(),
        }
    }
}

/// One entry of the ordered `request_stats` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStat {
    pub name: String,
    /// Field of the fingerprint struct backing this feature.
    pub datapoint: String,
}

fn default_rid_position() -> u32 {
    1
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// The ordered feature list with its fingerprint-field bindings.
    pub fn request_stats(&self) -> Result<Vec<RequestStat>> {
        let mut stats = Vec::with_capacity(self.request_stats.len());
        for (key, value) in &self.request_stats {
            let name = key
                .as_str()
                .ok_or_else(|| anyhow!("request_stats keys must be strings"))?
                .to_string();
            let datapoint = value
                .get("datapoint")
                .and_then(serde_yaml::Value::as_str)
                .ok_or_else(|| anyhow!("request_stats.{name} needs a datapoint field"))?
                .to_string();
            stats.push(RequestStat { name, datapoint });
        }
        Ok(stats)
    }

    pub fn validate(&self, anomaly_detection: bool) -> Result<()> {
        if self.applications.is_empty() {
            bail!("no applications configured");
        }

        let rid_type = self.applications[0].rid_type;
        if self.applications.iter().any(|app| app.rid_type != rid_type) {
            bail!("all applications must declare the same rid_type");
        }

        let app_monitors: usize = self.applications.iter().map(|a| a.monitors.len()).sum();
        if self.resource_monitors.is_empty() && self.hardware_monitors.is_empty() && app_monitors == 0
        {
            bail!("no monitors configured; nothing to attach");
        }

        let stats = self.request_stats()?;
        for stat in &stats {
            if RequestFingerprint::COUNTER_FIELDS
                .iter()
                .all(|field| *field != stat.datapoint)
            {
                bail!(
                    "request_stats.{} refers to unknown fingerprint field {}",
                    stat.name,
                    stat.datapoint
                );
            }
        }

        if anomaly_detection {
            let params = self
                .model_params
                .as_ref()
                .ok_or_else(|| anyhow!("anomaly detection requires model_params"))?;
            if params.k == 0 {
                bail!("model_params.k must be at least 1");
            }
            if params.k > MAX_CLUSTERS {
                bail!(
                    "model_params.k = {} exceeds the {} clusters the scoring table can hold",
                    params.k,
                    MAX_CLUSTERS
                );
            }
            if params.features.is_empty() {
                bail!("model_params.features must not be empty");
            }
            for feature in &params.features {
                if stats.iter().all(|stat| stat.name != *feature) {
                    bail!("model feature {feature} is not declared in request_stats");
                }
            }
        }

        Ok(())
    }

    /// RID width shared by all configured applications.
    pub fn rid_type(&self) -> RidType {
        self.applications
            .first()
            .map(|app| app.rid_type)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"ebpf_prog: /etc/finelame/finelame.c
train_time: 60
applications:
  - exec_path: /usr/bin/server
    rid_type: u64
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
        ret_fn_name: trace_req_end
        rid_position: 2
resource_monitors:
  - event: finish_task_switch
    in_fn_name: trace_ctx_switch
    side: k
    type: p
  - event: "exceptions:page_fault_user"
    in_fn_name: trace_page_fault
    side: k
    type: t
hardware_monitors:
  - event: CACHE_MISSES
    fn_name: on_cache_miss
    sample_period: 1000
request_stats:
  cputime:
    datapoint: cputime
  allocs:
    datapoint: allocs
  pagefaults:
    datapoint: page_faults
model_params:
  k: 2
  features: [cputime, allocs]
  scale_method: exponent
  m_scale: 10
  s_scale: 6
"#;

    #[test]
    fn parse_full_config() {
        let cfg: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        assert_eq!(cfg.ebpf_prog, PathBuf::from("/etc/finelame/finelame.c"));
        assert_eq!(cfg.train_time, Some(60));
        assert_eq!(cfg.rid_type(), RidType::U64);
        assert_eq!(cfg.applications[0].monitors[0].rid_position, 2);
        assert_eq!(cfg.resource_monitors.len(), 2);
        assert_eq!(cfg.resource_monitors[0].side, ProbeSide::Kernel);
        assert_eq!(cfg.resource_monitors[1].kind, ProbeKind::Tracepoint);
        let params = cfg.model_params.as_ref().unwrap();
        assert_eq!(params.k, 2);
        assert_eq!(params.m_scale, Some(10));
        cfg.validate(true).unwrap();
    }

    #[test]
    fn request_stats_preserve_document_order() {
        let cfg: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        let stats = cfg.request_stats().unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cputime", "allocs", "pagefaults"]);
        assert_eq!(stats[2].datapoint, "page_faults");
    }

    #[test]
    fn defaults_apply() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
request_stats:
  cputime: { datapoint: cputime }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.rid_type(), RidType::U32);
        assert_eq!(cfg.applications[0].monitors[0].rid_position, 1);
        assert!(cfg.train_time.is_none());
        cfg.validate(false).unwrap();
    }

    #[test]
    fn unknown_rid_type_is_a_parse_error() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    rid_type: u16
    monitors: []
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn monitors_are_required() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate(false).unwrap_err();
        assert!(err.to_string().contains("no monitors"));
    }

    #[test]
    fn model_features_must_be_request_stats() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
request_stats:
  cputime: { datapoint: cputime }
model_params:
  k: 2
  features: [cputime, cache_misses]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate(true).unwrap_err();
        assert!(err.to_string().contains("cache_misses"));
    }

    #[test]
    fn cluster_count_is_bounded_by_the_scoring_table() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
request_stats:
  cputime: { datapoint: cputime }
model_params:
  k: 9
  features: [cputime]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate(true).is_err());
    }

    #[test]
    fn unknown_datapoint_field_is_rejected() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
request_stats:
  rss: { datapoint: resident_pages }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn from_file_reports_the_path() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "ebpf_prog: [not a path").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
