//! Probe supervision: validation, attachment, and teardown of the kernel,
//! tracepoint, user, and perf-counter probes of the instrumentation program.
//!
//! Software attach failures abort startup (the program is useless without
//! its probes); hardware attach failures only cost the run that counter.
//! Detachment runs LIFO and never propagates errors.

use anyhow::{anyhow, bail, Context, Result};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::perf_event::{PerfEventLinkId, PerfEventScope, PerfTypeId, SamplePolicy};
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::{KProbe, PerfEvent, TracePoint, UProbe};
use aya::Ebpf;
use log::{error, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::config::Config;

/// Sampling period used when a hardware monitor does not declare one.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProbeSide {
    #[serde(rename = "k")]
    Kernel,
    #[serde(rename = "u")]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProbeKind {
    #[serde(rename = "p")]
    Probe,
    #[serde(rename = "t")]
    Tracepoint,
}

/// One probe to place: where it hooks (`event`) and which function of the
/// instrumentation program runs there (`program`).
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub event: String,
    pub program: String,
    pub is_ret: bool,
    pub side: ProbeSide,
    pub kind: ProbeKind,
    pub exec_path: Option<PathBuf>,
    pub sample_period: Option<u64>,
    pub cpus: Option<Vec<u32>>,
}

impl ProbeSpec {
    fn user(event: &str, program: &str, is_ret: bool, exec_path: PathBuf) -> Self {
        Self {
            event: event.to_string(),
            program: program.to_string(),
            is_ret,
            side: ProbeSide::User,
            kind: ProbeKind::Probe,
            exec_path: Some(exec_path),
            sample_period: None,
            cpus: None,
        }
    }

    fn hardware(event: &str, program: &str, sample_period: Option<u64>, cpus: Option<Vec<u32>>) -> Self {
        Self {
            event: event.to_string(),
            program: program.to_string(),
            is_ret: false,
            side: ProbeSide::Kernel,
            kind: ProbeKind::Probe,
            exec_path: None,
            sample_period,
            cpus,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.side == ProbeSide::User {
            if self.kind != ProbeKind::Probe {
                bail!("can only use probes on user-space functions ({})", self.event);
            }
            if self.exec_path.is_none() {
                bail!("must provide exec_path for user probe on {}", self.event);
            }
        }
        if self.is_ret && (self.side == ProbeSide::Kernel || self.kind == ProbeKind::Tracepoint) {
            bail!(
                "return probes are not available for kernel events or tracepoints ({})",
                self.event
            );
        }
        Ok(())
    }
}

/// Probes grouped by attach phase, in attach order.
pub struct ProbePlan {
    pub resource: Vec<ProbeSpec>,
    pub hardware: Vec<ProbeSpec>,
    pub application: Vec<ProbeSpec>,
}

/// Turn the configuration into validated probe specs. Any rule violation is
/// reported here, before the instrumentation program is touched.
pub fn build_plan(config: &Config) -> Result<ProbePlan> {
    let mut resource = Vec::new();
    for monitor in &config.resource_monitors {
        for (program, is_ret) in [(&monitor.in_fn_name, false), (&monitor.ret_fn_name, true)] {
            if let Some(program) = program {
                resource.push(ProbeSpec {
                    event: monitor.event.clone(),
                    program: program.clone(),
                    is_ret,
                    side: monitor.side,
                    kind: monitor.kind,
                    exec_path: monitor.exec_path.clone(),
                    sample_period: None,
                    cpus: None,
                });
            }
        }
    }

    let mut hardware = Vec::new();
    for monitor in &config.hardware_monitors {
        hardware.push(ProbeSpec::hardware(
            &monitor.event,
            &monitor.fn_name,
            monitor.sample_period,
            monitor.cpus.clone(),
        ));
    }

    let mut application = Vec::new();
    for app in &config.applications {
        for monitor in &app.monitors {
            if let Some(in_fn) = &monitor.in_fn_name {
                application.push(ProbeSpec::user(
                    &monitor.event,
                    in_fn,
                    false,
                    app.exec_path.clone(),
                ));
            }
            if let Some(ret_fn) = &monitor.ret_fn_name {
                application.push(ProbeSpec::user(
                    &monitor.event,
                    ret_fn,
                    true,
                    app.exec_path.clone(),
                ));
            }
        }
    }

    for spec in resource.iter().chain(&hardware).chain(&application) {
        spec.validate()?;
    }

    Ok(ProbePlan {
        resource,
        hardware,
        application,
    })
}

/// `PERF_COUNT_HW_*` value for a configured hardware counter name.
pub fn hardware_event_config(event: &str) -> Option<u64> {
    let config = match event {
        "CPU_CYCLES" => 0,
        "INSTRUCTIONS" => 1,
        "CACHE_REFERENCES" => 2,
        "CACHE_MISSES" => 3,
        "BRANCH_INSTRUCTIONS" => 4,
        "BRANCH_MISSES" => 5,
        "BUS_CYCLES" => 6,
        "STALLED_CYCLES_FRONTEND" => 7,
        "STALLED_CYCLES_BACKEND" => 8,
        "REF_CPU_CYCLES" => 9,
        _ => return None,
    };
    Some(config)
}

enum Attachment {
    KernelProbe {
        program: String,
        event: String,
        link: KProbeLinkId,
    },
    Tracepoint {
        program: String,
        event: String,
        link: TracePointLinkId,
    },
    UserProbe {
        program: String,
        event: String,
        is_ret: bool,
        link: UProbeLinkId,
    },
    HardwareCounter {
        program: String,
        event: String,
        links: Vec<PerfEventLinkId>,
    },
}

/// Owns every live attachment. Software and hardware probes are tracked in
/// separate lists; both are torn down LIFO.
#[derive(Default)]
pub struct ProbeSupervisor {
    software: Vec<Attachment>,
    hardware: Vec<Attachment>,
    loaded: HashSet<String>,
}

impl ProbeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn software_count(&self) -> usize {
        self.software.len()
    }

    pub fn hardware_count(&self) -> usize {
        self.hardware.len()
    }

    /// Attach a kernel, tracepoint, or user probe. Errors abort startup.
    pub fn attach(&mut self, bpf: &mut Ebpf, spec: &ProbeSpec) -> Result<()> {
        spec.validate()?;
        match (spec.side, spec.kind) {
            (ProbeSide::Kernel, ProbeKind::Probe) => self.attach_kprobe(bpf, spec),
            (_, ProbeKind::Tracepoint) => self.attach_tracepoint(bpf, spec),
            (ProbeSide::User, ProbeKind::Probe) => self.attach_uprobe(bpf, spec),
        }
        .with_context(|| format!("failed to attach probe on {}", spec.event))
    }

    /// Attach a hardware perf counter on the given CPUs (`default_cpus` when
    /// the descriptor names none). Failures are logged; the run continues
    /// without the counter.
    pub fn attach_hardware(&mut self, bpf: &mut Ebpf, spec: &ProbeSpec, default_cpus: &[u32]) {
        if let Err(err) = self.attach_hardware_inner(bpf, spec, default_cpus) {
            error!("failed to attach hardware event {}: {err:#}", spec.event);
        }
    }

    fn attach_kprobe(&mut self, bpf: &mut Ebpf, spec: &ProbeSpec) -> Result<()> {
        let program: &mut KProbe = bpf
            .program_mut(&spec.program)
            .ok_or_else(|| anyhow!("{} program not found", spec.program))?
            .try_into()?;
        if self.loaded.insert(spec.program.clone()) {
            program.load()?;
        }
        let link = program.attach(&spec.event, 0)?;
        info!("attached kprobe on {}", spec.event);
        self.software.push(Attachment::KernelProbe {
            program: spec.program.clone(),
            event: spec.event.clone(),
            link,
        });
        Ok(())
    }

    fn attach_tracepoint(&mut self, bpf: &mut Ebpf, spec: &ProbeSpec) -> Result<()> {
        let (category, name) = spec
            .event
            .split_once(':')
            .ok_or_else(|| anyhow!("tracepoint event must be category:name, got {}", spec.event))?;
        let program: &mut TracePoint = bpf
            .program_mut(&spec.program)
            .ok_or_else(|| anyhow!("{} program not found", spec.program))?
            .try_into()?;
        if self.loaded.insert(spec.program.clone()) {
            program.load()?;
        }
        let link = program.attach(category, name)?;
        info!("attached tracepoint on {}", spec.event);
        self.software.push(Attachment::Tracepoint {
            program: spec.program.clone(),
            event: spec.event.clone(),
            link,
        });
        Ok(())
    }

    fn attach_uprobe(&mut self, bpf: &mut Ebpf, spec: &ProbeSpec) -> Result<()> {
        let target = spec
            .exec_path
            .as_ref()
            .ok_or_else(|| anyhow!("user probe on {} has no exec_path", spec.event))?;
        let program: &mut UProbe = bpf
            .program_mut(&spec.program)
            .ok_or_else(|| anyhow!("{} program not found", spec.program))?
            .try_into()?;
        if self.loaded.insert(spec.program.clone()) {
            program.load()?;
        }
        let pid: Option<libc::pid_t> = None;
        let link = program.attach(Some(spec.event.as_str()), 0, target, pid)?;
        info!(
            "attached {} on {}",
            if spec.is_ret { "uretprobe" } else { "uprobe" },
            spec.event
        );
        self.software.push(Attachment::UserProbe {
            program: spec.program.clone(),
            event: spec.event.clone(),
            is_ret: spec.is_ret,
            link,
        });
        Ok(())
    }

    fn attach_hardware_inner(
        &mut self,
        bpf: &mut Ebpf,
        spec: &ProbeSpec,
        default_cpus: &[u32],
    ) -> Result<()> {
        let config = hardware_event_config(&spec.event)
            .ok_or_else(|| anyhow!("unknown hardware event {}", spec.event))?;
        let period = spec.sample_period.unwrap_or_else(|| {
            warn!(
                "no sample period given for perf event {}; setting it to {}",
                spec.event, DEFAULT_SAMPLE_PERIOD
            );
            DEFAULT_SAMPLE_PERIOD
        });
        let cpus = spec.cpus.as_deref().unwrap_or(default_cpus);

        let program: &mut PerfEvent = bpf
            .program_mut(&spec.program)
            .ok_or_else(|| anyhow!("{} program not found", spec.program))?
            .try_into()?;
        if self.loaded.insert(spec.program.clone()) {
            program.load()?;
        }

        let mut links = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            match program.attach(
                PerfTypeId::Hardware,
                config,
                PerfEventScope::AllProcessesOneCpu { cpu },
                SamplePolicy::Period(period),
                true,
            ) {
                Ok(link) => links.push(link),
                Err(err) => {
                    for link in links.drain(..) {
                        let _ = program.detach(link);
                    }
                    return Err(err.into());
                }
            }
        }
        info!(
            "attached hardware monitor {} (period {period}, {} cpus)",
            spec.event,
            cpus.len()
        );
        self.hardware.push(Attachment::HardwareCounter {
            program: spec.program.clone(),
            event: spec.event.clone(),
            links,
        });
        Ok(())
    }

    /// Detach everything, software first, each list in reverse attach order.
    /// Detach errors are logged and swallowed.
    pub fn detach_all(&mut self, bpf: &mut Ebpf) {
        while let Some(attachment) = self.software.pop() {
            detach_one(bpf, attachment);
        }
        while let Some(attachment) = self.hardware.pop() {
            detach_one(bpf, attachment);
        }
    }
}

fn detach_one(bpf: &mut Ebpf, attachment: Attachment) {
    match attachment {
        Attachment::KernelProbe {
            program,
            event,
            link,
        } => {
            let result = (|| -> Result<()> {
                let prog: &mut KProbe = bpf
                    .program_mut(&program)
                    .ok_or_else(|| anyhow!("{program} program not found"))?
                    .try_into()?;
                prog.detach(link)?;
                Ok(())
            })();
            match result {
                Ok(()) => info!("detached kprobe from {event}"),
                Err(err) => warn!("failed to detach kprobe from {event}: {err:#}"),
            }
        }
        Attachment::Tracepoint {
            program,
            event,
            link,
        } => {
            let result = (|| -> Result<()> {
                let prog: &mut TracePoint = bpf
                    .program_mut(&program)
                    .ok_or_else(|| anyhow!("{program} program not found"))?
                    .try_into()?;
                prog.detach(link)?;
                Ok(())
            })();
            match result {
                Ok(()) => info!("detached tracepoint from {event}"),
                Err(err) => warn!("failed to detach tracepoint from {event}: {err:#}"),
            }
        }
        Attachment::UserProbe {
            program,
            event,
            is_ret,
            link,
        } => {
            let kind = if is_ret { "uretprobe" } else { "uprobe" };
            let result = (|| -> Result<()> {
                let prog: &mut UProbe = bpf
                    .program_mut(&program)
                    .ok_or_else(|| anyhow!("{program} program not found"))?
                    .try_into()?;
                prog.detach(link)?;
                Ok(())
            })();
            match result {
                Ok(()) => info!("detached {kind} from {event}"),
                Err(err) => warn!("failed to detach {kind} from {event}: {err:#}"),
            }
        }
        Attachment::HardwareCounter {
            program,
            event,
            links,
        } => {
            let result = (|| -> Result<()> {
                let prog: &mut PerfEvent = bpf
                    .program_mut(&program)
                    .ok_or_else(|| anyhow!("{program} program not found"))?
                    .try_into()?;
                for link in links.into_iter().rev() {
                    prog.detach(link)?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => info!("detached hardware monitor ({event})"),
                Err(err) => warn!("failed to detach hardware monitor {event}: {err:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> ProbeSpec {
        ProbeSpec {
            event: "handle_request".to_string(),
            program: "trace_req_start".to_string(),
            is_ret: false,
            side: ProbeSide::User,
            kind: ProbeKind::Probe,
            exec_path: Some(PathBuf::from("/usr/bin/server")),
            sample_period: None,
            cpus: None,
        }
    }

    #[test]
    fn user_probes_need_an_exec_path() {
        let mut spec = base_spec();
        spec.exec_path = None;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn user_tracepoints_are_rejected() {
        let mut spec = base_spec();
        spec.kind = ProbeKind::Tracepoint;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn kernel_return_probes_are_rejected() {
        let mut spec = base_spec();
        spec.side = ProbeSide::Kernel;
        spec.exec_path = None;
        spec.is_ret = true;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn tracepoint_return_probes_are_rejected() {
        let mut spec = base_spec();
        spec.side = ProbeSide::Kernel;
        spec.kind = ProbeKind::Tracepoint;
        spec.exec_path = None;
        spec.is_ret = true;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn user_return_probes_are_allowed() {
        let mut spec = base_spec();
        spec.is_ret = true;
        spec.validate().unwrap();
    }

    #[test]
    fn hardware_event_names_map_to_perf_configs() {
        assert_eq!(hardware_event_config("CPU_CYCLES"), Some(0));
        assert_eq!(hardware_event_config("CACHE_MISSES"), Some(3));
        assert_eq!(hardware_event_config("REF_CPU_CYCLES"), Some(9));
        assert_eq!(hardware_event_config("L9_EXOTIC"), None);
    }

    #[test]
    fn plan_groups_probes_by_attach_phase() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
    monitors:
      - event: handle_request
        in_fn_name: trace_req_start
        ret_fn_name: trace_req_end
resource_monitors:
  - event: finish_task_switch
    in_fn_name: trace_ctx_switch
    side: k
    type: p
hardware_monitors:
  - event: CACHE_MISSES
    fn_name: on_cache_miss
    sample_period: 1000
request_stats:
  cputime: { datapoint: cputime }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = build_plan(&config).unwrap();

        assert_eq!(plan.resource.len(), 1);
        assert_eq!(plan.resource[0].program, "trace_ctx_switch");
        assert_eq!(plan.hardware.len(), 1);
        assert_eq!(plan.hardware[0].sample_period, Some(1000));
        assert_eq!(plan.application.len(), 2);
        assert!(!plan.application[0].is_ret);
        assert!(plan.application[1].is_ret);
        assert_eq!(
            plan.application[1].exec_path.as_deref(),
            Some(std::path::Path::new("/usr/bin/server"))
        );
    }

    #[test]
    fn plan_rejects_invalid_descriptors() {
        let yaml = r#"ebpf_prog: fl.c
applications:
  - exec_path: /usr/bin/server
resource_monitors:
  - event: "sched:sched_switch"
    ret_fn_name: trace_ret
    side: k
    type: t
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(build_plan(&config).is_err());
    }
}
