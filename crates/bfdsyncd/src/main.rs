//! BFD Session Daemon
//!
//! Main entry point for bfdsyncd. Opens or reattaches the shared session
//! segment, provisions configured sessions, and serves BFD control packets
//! and detection timeouts until shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use sonic_bfdsyncd::{
    audit_log, init_logging, init_logging_pretty, AuditCategory, AuditOutcome, AuditRecord,
    BfdError, BfdOrch, BfdsyncConfig, EventIntake, FailureReporter, HealthPoller, PacketListener,
    SegmentFileProbe, SessionEntry, SessionRead, SessionStore, TracingNotifier,
    DEFAULT_CONFIG_PATH,
};
use sonic_sai::api::SoftwareBfdOffload;
use sonic_shm_arena::SegmentOrigin;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// SONiC BFD session daemon
#[derive(Parser, Debug)]
#[command(name = "bfdsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty_logs: bool,

    /// Reinitialise the session segment even if it can be reattached
    #[arg(long)]
    cold_start: bool,

    /// Override the configured session capacity
    #[arg(long)]
    capacity: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.pretty_logs {
        init_logging_pretty(&args.log_level);
    } else {
        init_logging(&args.log_level);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("bfdsyncd exiting on failure: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = BfdsyncConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.cold_start {
        config.segment.warm_restart = false;
    }
    if let Some(capacity) = args.capacity {
        config.segment.bfd_session_capacity = capacity;
    }
    config.validate()?;

    audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "bfdsyncd", "start")
        .with_outcome(AuditOutcome::InProgress)
        .with_object_id(config.segment.path.display().to_string())
        .with_details(serde_json::json!({
            "capacity": config.segment.bfd_session_capacity,
            "warm_restart": config.segment.warm_restart,
            "sessions": config.sessions.len(),
        })));

    let store = SessionStore::open(&config.segment_config(), config.segment.bfd_session_capacity)
        .context("opening session segment")?;
    let origin = store.origin();
    let layout = store.segment().layout().clone();

    let mut orch = BfdOrch::new(
        store,
        Arc::new(SoftwareBfdOffload::new()),
        Arc::new(TracingNotifier),
    );

    if origin == SegmentOrigin::Attached {
        let report = orch.reconcile_after_attach()?;
        info!(
            sessions = report.sessions,
            reprogrammed = report.reprogrammed,
            recreated = report.recreated,
            failed = report.failed.len(),
            corrupted = report.corrupted.len(),
            "warm restart reconciled"
        );
    }
    provision_sessions(&mut orch, &config.sessions)?;

    let reporter = FailureReporter::new();
    let health = HealthPoller::new(config.health_poll_interval(), reporter.clone())
        .with_probe(Box::new(SegmentFileProbe::new(&config.segment.path, layout)))
        .spawn()
        .context("starting health poller")?;

    let (mut intake, sender) = EventIntake::new(orch, &config.intake, reporter.clone());
    let armed = intake.arm_existing(Instant::now())?;
    if armed > 0 {
        info!(armed, "detection timers restored");
    }

    let mut listeners = Vec::new();
    if config.listener.enabled {
        for multihop in [false, true] {
            let listener = PacketListener::bind_default(config.listener.bind_addr, multihop)
                .await
                .with_context(|| format!("binding BFD listener (multihop {})", multihop))?;
            listeners.push(tokio::spawn(
                listener.run(sender.clone(), reporter.subscribe()),
            ));
        }
    }
    drop(sender);

    spawn_signal_handler(reporter.clone())?;

    let outcome = intake.run().await;

    for handle in listeners {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "listener failed"),
            Err(e) => warn!(error = %e, "listener task aborted"),
        }
    }
    health.stop();

    let orch = outcome?;
    let stats = orch.stats().clone();
    orch.into_store().detach()?;

    if let Some(failure) = reporter.failure() {
        bail!("terminal failure: {}", failure);
    }

    audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "bfdsyncd", "stop")
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "sessions_created": stats.sessions_created,
            "state_changes": stats.state_changes,
            "timeouts": stats.timeouts,
            "adapter_failures": stats.adapter_failures,
        })));
    Ok(())
}

/// Creates configured sessions that the segment does not already hold.
fn provision_sessions(orch: &mut BfdOrch, entries: &[SessionEntry]) -> Result<(), BfdError> {
    for entry in entries {
        let existing = orch
            .store()
            .read()?
            .find_by_local_discriminator(entry.local_discriminator)?;
        if existing.is_some() {
            continue;
        }
        match orch.create_session(&entry.to_session_config()) {
            Ok(oid) => info!(
                session = %oid,
                local = entry.local_discriminator,
                peer = %entry.peer,
                "configured session created"
            ),
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => warn!(
                local = entry.local_discriminator,
                error = %e,
                "configured session not created"
            ),
        }
    }
    Ok(())
}

fn spawn_signal_handler(reporter: Arc<FailureReporter>) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        reporter.request_shutdown();
    });
    Ok(())
}
