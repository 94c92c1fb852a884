//! `dvrk-arm-test` – runs the arm exercise end to end.
//!
//! 1. Loads `~/.dvrk/config.toml` (or `DVRK_CONFIG`), falling back to
//!    defaults, then applies `DVRK_*` overrides.
//! 2. Starts a simulated arm on an in-process bus and opens an
//!    [`ArmSession`] on it.
//! 3. Runs home → joint direct → joint goal → cartesian setup.
//! 4. Intercepts **Ctrl-C** to request an orderly shutdown.
//!
//! Exit codes: `0` success, `1` fatal failure or bad configuration, `130`
//! interrupted.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use tracing::{error, warn};

use dvrk_hal::SimArm;
use dvrk_kernel::{ArmSession, ShutdownSignal};
use dvrk_middleware::EventBus;
use dvrk_runtime::{MotionSequencer, SequenceReport, init_tracing};
use dvrk_types::ArmError;

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let _guard = init_tracing("dvrk-arm-test");

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    print_banner();

    if args.iter().any(|a| a == "--write-config") {
        return write_default_config();
    }

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("  {}: {e}", "Config error".red());
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    println!(
        "  Arm {} on {} (timeouts {}s, sweep {}s @ {} Hz)\n",
        cfg.arm.bold(),
        cfg.topics().prefix().dimmed(),
        cfg.wait_timeout_secs,
        cfg.sweep_duration_secs,
        cfg.sweep_rate_hz
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = ShutdownSignal::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping the sequence …".yellow().bold());
            interrupted.store(true, Ordering::SeqCst);
            shutdown.request("operator interrupt (Ctrl-C)");
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will abort immediately");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let (result, report) = runtime.block_on(run_sequence(&cfg, shutdown.clone()));
    print_summary(&report, &result);

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

/// Wire bus, simulated arm, session and sequencer, then run until the
/// sequence ends or shutdown is requested.
async fn run_sequence(
    cfg: &config::Config,
    shutdown: ShutdownSignal,
) -> (Result<SequenceReport, ArmError>, SequenceReport) {
    let bus = Arc::new(EventBus::default());
    let topics = cfg.topics();

    let _sim = match SimArm::spawn(Arc::clone(&bus), topics.clone(), cfg.to_sim_config()) {
        Ok(sim) => sim,
        Err(e) => return (Err(e), SequenceReport::default()),
    };
    let session = match ArmSession::connect(bus, topics) {
        Ok(session) => session,
        Err(e) => return (Err(e), SequenceReport::default()),
    };

    let mut sequencer = MotionSequencer::new(session, cfg.to_sequencer_config(), shutdown.clone());
    let result = tokio::select! {
        biased;
        result = sequencer.run() => result,
        () = shutdown.requested() => Err(ArmError::ShutdownRequested(
            shutdown.reason().unwrap_or_default(),
        )),
    };
    (result, sequencer.report().clone())
}

fn write_default_config() -> ExitCode {
    let path = config::config_path();
    if path.exists() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return ExitCode::SUCCESS;
    }
    match config::save_to(&config::Config::default(), &path) {
        Ok(()) => {
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("  {}: {e}", "Error saving config".red());
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"      ___   _____  __ __"#.bold().cyan());
    println!("{}", r#"  ___/ / | / / _ \/ //_/"#.bold().cyan());
    println!("{}", r#" / _  /| |/ / , _/ ,<   "#.bold().cyan());
    println!("{}", r#" \_,_/ |___/_/|_/_/|_|  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "dvrk-arm-test".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!();
}

fn print_usage() {
    println!("Usage: dvrk-arm-test [--write-config]");
    println!();
    println!("  --write-config   write the default config to ~/.dvrk/config.toml (or DVRK_CONFIG)");
    println!("  -h, --help       show this help");
}

fn print_summary(report: &SequenceReport, result: &Result<SequenceReport, ArmError>) {
    println!();
    for stage in &report.completed {
        println!("  {} {stage}", "✓".green().bold());
    }
    if report.homing_attempts > 0 {
        println!("  homing took {} wait(s)", report.homing_attempts);
    }
    if report.sweep_samples > 0 {
        println!("  sweep published {} sample(s)", report.sweep_samples);
    }
    if let Some(pose) = &report.cartesian_pose {
        println!(
            "  cartesian position ({:.4}, {:.4}, {:.4})",
            pose.position.x, pose.position.y, pose.position.z
        );
    }
    match result {
        Ok(_) => println!("\n  {}\n", "Sequence complete.".green().bold()),
        Err(e) => println!("\n  {} {e}\n", "Sequence stopped:".red().bold()),
    }
}
