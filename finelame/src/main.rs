use anyhow::{anyhow, bail, Context, Result};
use caps::{CapSet, Capability};
use clap::Parser;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

use finelame::artifacts::ArtifactConfig;
use finelame::config::Config;
use finelame::dataplane::{self, DataPlane};
use finelame::detector::Detector;
use finelame::notify;
use finelame::pipeline::Pipeline;
use finelame::probes::{self, ProbePlan, ProbeSupervisor};
use finelame::rewrite::{self, TemplateSubstitutions};

#[derive(Parser, Debug)]
#[command(name = "start_finelame")]
#[command(about = "Per-request resource accounting and DoS anomaly detection")]
struct Args {
    /// YAML configuration file
    config_file: PathBuf,
    /// Label appended to every output artifact
    run_label: String,
    /// Output directory
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Training window length in seconds (overrides the config file)
    #[arg(long)]
    train_time: Option<u64>,
    /// Substitute the trace printk into the instrumentation program
    #[arg(long)]
    debug: bool,
    /// Train a model and have the data plane score live requests
    #[arg(long)]
    ano_detect: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("starting finelame");

    let config = Config::from_file(&args.config_file)?;
    config.validate(args.ano_detect)?;
    let rid_type = config.rid_type();
    let request_stats = config.request_stats()?;

    ensure_environment()?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create output directory {}", args.out.display()))?;

    let detector = if args.ano_detect {
        let params = config
            .model_params
            .as_ref()
            .ok_or_else(|| anyhow!("anomaly detection requires model_params"))?;
        Some(Detector::new(params))
    } else {
        None
    };
    let train_time = resolve_train_time(config.train_time, args.train_time, args.ano_detect)?;
    if let Some(train_time) = train_time {
        info!("setting train time to {}s", train_time.as_secs());
    }

    // configuration problems in the probe set surface before any kernel work
    let plan = probes::build_plan(&config)?;

    let rid_positions = config
        .applications
        .iter()
        .flat_map(|app| app.monitors.iter())
        .filter_map(|monitor| {
            monitor
                .in_fn_name
                .clone()
                .map(|fn_name| (fn_name, monitor.rid_position))
        })
        .collect();
    let substitutions = TemplateSubstitutions {
        debug: args.debug,
        clusters: detector.as_ref().map(|d| d.k),
        m_scale: detector.as_ref().map(|d| d.policy.means),
        rid_type,
        rid_positions,
    };
    let rewritten = rewrite::rewrite_template(&config.ebpf_prog, &substitutions)?;
    info!("rewrote instrumentation program into {}", rewritten.display());

    let object = dataplane::compile_program(&rewritten)?;
    let mut plane = DataPlane::load(&object, rid_type)?;

    let online = aya::util::online_cpus()
        .map_err(|(_, err)| err)
        .context("failed to enumerate online cpus")?;

    // resource monitors first, hardware second, application probes last: the
    // data plane must be fully initialized before application probes fire
    let mut supervisor = ProbeSupervisor::new();
    if let Err(err) = attach_all(&mut supervisor, &mut plane, &plan, &online) {
        supervisor.detach_all(plane.bpf_mut());
        return Err(err);
    }
    info!(
        "attached {} software and {} hardware monitors",
        supervisor.software_count(),
        supervisor.hardware_count()
    );

    match plane.notification_buffers() {
        Ok(buffers) => notify::start_listener(buffers),
        Err(err) => warn!("notification channel unavailable: {err:#}"),
    }

    let mut pipeline = Pipeline::new(
        plane,
        supervisor,
        detector,
        train_time,
        request_stats,
        rid_type,
    );
    info!("running in {} mode", pipeline.mode());

    let is_running = Arc::new(AtomicBool::new(true));
    {
        let flag = Arc::clone(&is_running);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
            }
            flag.store(false, Ordering::SeqCst);
        });
    }
    {
        let flag = Arc::clone(&is_running);
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("SIGTERM received");
                    flag.store(false, Ordering::SeqCst);
                }
                Err(err) => warn!("failed to install SIGTERM handler: {err}"),
            }
        });
    }

    let mut rng = StdRng::from_entropy();
    while is_running.load(Ordering::SeqCst) {
        sleep(Duration::from_secs(1)).await;
        if let Err(err) = pipeline.tick(&mut rng) {
            error!("control loop iteration failed: {err:#}");
        }
    }

    info!("shutting down");
    pipeline.shutdown(&ArtifactConfig {
        outdir: args.out,
        run_label: args.run_label,
        config_path: args.config_file,
    });
    Ok(())
}

fn attach_all(
    supervisor: &mut ProbeSupervisor,
    plane: &mut DataPlane,
    plan: &ProbePlan,
    online: &[u32],
) -> Result<()> {
    for spec in &plan.resource {
        supervisor.attach(plane.bpf_mut(), spec)?;
    }
    for spec in &plan.hardware {
        supervisor.attach_hardware(plane.bpf_mut(), spec, online);
    }
    for spec in &plan.application {
        supervisor.attach(plane.bpf_mut(), spec)?;
    }
    Ok(())
}

/// The command line wins over the config file, with a warning when both are
/// set. Anomaly detection cannot run without a window.
fn resolve_train_time(
    from_config: Option<u64>,
    from_cli: Option<u64>,
    anomaly_detection: bool,
) -> Result<Option<Duration>> {
    let seconds = match (from_cli, from_config) {
        (Some(cli), Some(_)) => {
            warn!("ignoring config train time in favor of the command line");
            Some(cli)
        }
        (Some(cli), None) => Some(cli),
        (None, from_config) => from_config,
    };
    if anomaly_detection && seconds.is_none() {
        bail!("anomaly detection requires a training window (train_time or --train-time)");
    }
    Ok(seconds.map(Duration::from_secs))
}

fn ensure_environment() -> Result<()> {
    check_capabilities()?;
    check_kernel_version(4, 14)?;
    Ok(())
}

fn check_capabilities() -> Result<()> {
    let required = [
        Capability::CAP_BPF,
        Capability::CAP_PERFMON,
        Capability::CAP_SYS_ADMIN,
    ];
    for cap in &required {
        let has_cap = caps::has_cap(None, CapSet::Effective, *cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            bail!(
                "missing {:?}; grant it with `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v start_finelame)`",
                cap
            );
        }
    }
    Ok(())
}

fn check_kernel_version(min_major: u32, min_minor: u32) -> Result<()> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;
    let version =
        parse_kernel_version(&release).context("unable to parse kernel release string")?;
    if version < (min_major, min_minor) {
        bail!(
            "kernel {}.{} lacks the probe support required; need >= {min_major}.{min_minor}",
            version.0,
            version.1
        );
    }
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}
