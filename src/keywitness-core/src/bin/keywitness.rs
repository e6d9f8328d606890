//! keywitness CLI - inspect anchor capabilities, validate configuration and
//! run simulated sessions through the full trust pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use keywitness_anchor::detect_hardware_type;
use keywitness_core::{
    create_trust_anchor, select_sources, EvidenceRecord, HardwareTrustBinding, RawEventSource, SessionInfo,
    SimulatedSource, SourceLayer, WitnessConfig, WitnessError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// keywitness - evidence that a human typed it.
///
/// Events from two independent sources are cross-checked, folded into a
/// MACed hash chain, analysed for machine-like timing and bound to a trust
/// anchor's monotonic counter and quotes.
#[derive(Parser)]
#[command(name = "keywitness")]
#[command(version = VERSION)]
#[command(about = "Layered trust pipeline for human keystroke evidence")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show platform trust anchor capabilities
    Info,

    /// Run a simulated session and print its evidence
    Simulate(SimulateArgs),

    /// Validate a JSON configuration file
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Events seen by the primary source
    #[arg(long, default_value = "100")]
    primary: u64,

    /// Events seen by the reference source
    #[arg(long, default_value = "100")]
    reference: u64,

    /// Reconciliation ticks to spread events over
    #[arg(long, default_value = "10")]
    ticks: u64,

    /// Mean interval between physical key presses in milliseconds
    #[arg(long, default_value = "120")]
    interval_ms: u64,

    /// Credit only reference-confirmed events
    #[arg(long, conflicts_with = "permissive")]
    strict: bool,

    /// Credit every primary event
    #[arg(long)]
    permissive: bool,

    /// Run without a trust anchor
    #[arg(long, conflicts_with = "software_anchor")]
    no_anchor: bool,

    /// Fall back to the software anchor when no hardware anchor exists
    #[arg(long)]
    software_anchor: bool,

    /// Simulate a missing reference source
    #[arg(long)]
    no_reference: bool,

    /// Seal a hardware checkpoint every N ticks
    #[arg(long, default_value = "5")]
    checkpoint_every: u64,

    /// Seed for interval jitter
    #[arg(long)]
    seed: Option<u64>,

    /// Configuration file (defaults apply otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session identifier
    #[arg(long, default_value = "simulated-session")]
    session_id: String,
}

/// Events landing in tick `i` when `total` is spread over `ticks`.
fn share(total: u64, ticks: u64, i: u64) -> u64 {
    total * (i + 1) / ticks - total * i / ticks
}

fn show_system_info() {
    println!("\nSYSTEM INFORMATION");
    println!("==================\n");

    println!("keywitness Version: {}", VERSION);
    println!();

    println!("Platform:");
    println!("  OS: {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);
    println!();

    let caps = detect_hardware_type();
    println!("Trust Anchor:");
    println!("  Hardware type: {:?}", caps.hardware_type);
    println!("  Hardware present: {}", caps.has_hardware);
    println!("  Attestation: {}", caps.supports_attestation);
    println!("  Sealing: {}", caps.supports_sealing);
    if let Some(path) = &caps.device_path {
        println!("  Device: {}", path);
    }
    println!("  Security level: {}", caps.hardware_type.security_level());
    println!();

    println!("Cryptographic Capabilities:");
    println!("  MAC: HMAC-SHA256");
    println!("  Quote signatures: Ed25519, ECDSA P-256");
}

async fn run_simulation(args: &SimulateArgs) -> Result<(EvidenceRecord, bool), WitnessError> {
    let mut config = match &args.config {
        Some(path) => WitnessConfig::from_file(path)?,
        None => WitnessConfig::default(),
    };
    if args.strict {
        config.validator.strict = true;
    } else if args.permissive {
        config.validator.strict = false;
    }
    let ticks = args.ticks.max(1);

    let primary = SimulatedSource::new("simulated-os", SourceLayer::Primary);
    let reference = if args.no_reference {
        SimulatedSource::unavailable("simulated-hid", SourceLayer::Reference, "disabled by --no-reference")
    } else {
        SimulatedSource::new("simulated-hid", SourceLayer::Reference)
    };
    let sources = select_sources(&primary, Some(&reference))?;

    let anchor = if args.no_anchor {
        None
    } else {
        create_trust_anchor(config.allow_software_anchor || args.software_anchor)
    };
    let binding = HardwareTrustBinding::from_config(&config, sources, anchor).await?;
    let session = SessionInfo::new(args.session_id.clone());

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mean = args.interval_ms.max(1);
    let jitter = mean * 2 / 5;
    let mut at = Instant::now();

    for i in 0..ticks {
        let physical = share(args.reference, ticks, i);
        reference.emit(physical);
        primary.emit(share(args.primary, ticks, i));

        for _ in 0..physical {
            at += Duration::from_millis(rng.gen_range(mean.saturating_sub(jitter)..=mean + jitter));
            binding.record_event(at).await;
        }
        binding.tick().await;

        if args.checkpoint_every > 0 && (i + 1) % args.checkpoint_every == 0 {
            if let Err(e) = binding.seal_with_hardware().await {
                tracing::warn!(error = %e, tick = i, "Checkpoint not sealed");
            }
        }
    }

    let record = binding.export_evidence(&session).await?;
    let verified = match binding.verify_evidence(&record).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Exported evidence failed verification");
            false
        },
    };

    primary.stop();
    reference.stop();
    binding.close().await;
    Ok((record, verified))
}

fn print_evidence(record: &EvidenceRecord, verified: bool) {
    let stats = &record.validation_stats;
    let timing = &record.anomaly_report;

    println!("\nSESSION EVIDENCE");
    println!("================\n");
    println!("Session:            {}", record.session_id);
    match record.final_count {
        Some(count) => println!("Validated count:    {}", count),
        None => println!("Validated count:    \x1b[31mTAINTED\x1b[0m"),
    }
    if let Some(reason) = &record.compromise_reason {
        println!("Compromised:        {}", reason);
    }
    println!(
        "Mode:               {}{}",
        if record.strict_mode { "strict" } else { "permissive" },
        if record.reference_available { "" } else { " (no reference source)" }
    );
    println!(
        "Primary/reference:  {} / {}",
        stats.primary_count, stats.reference_count
    );
    println!(
        "Synthetic:          {} ({:.1}%)",
        stats.total_synthetic_detected, stats.synthetic_percentage
    );
    println!(
        "Timing anomalies:   {} of {} ({:.1}%)",
        timing.anomalous_events, timing.total_events, timing.anomaly_percentage
    );
    if !timing.reason_codes.is_empty() {
        println!("Reason codes:       {}", timing.reason_codes.join(", "));
    }
    println!(
        "Trust anchor:       {}",
        match (record.hardware_available, record.hardware_backed) {
            (true, true) => "hardware",
            (true, false) => "software (no hardware guarantee)",
            (false, _) => "none",
        }
    );
    println!("Hardware counter:   {}", record.hw_counter);
    println!("Checkpoints:        {}", record.checkpoints.len());
    println!("Chain updates:      {}", record.update_counter);
    println!("Chain head:         {}", hex::encode(record.final_chain_hash));
    println!();

    if verified {
        println!("\x1b[32m[OK]\x1b[0m Evidence signature and checkpoints verified");
    } else {
        println!("\x1b[31m[FAIL]\x1b[0m Evidence did not verify");
    }
    if record.is_human_likely() {
        println!("\x1b[32m[OK]\x1b[0m Activity consistent with a human typist");
    } else {
        println!("\x1b[33m[WARN]\x1b[0m Activity not consistent with a human typist");
    }
}

fn check_config(path: &Path, json: bool) -> ExitCode {
    match WitnessConfig::from_file(path) {
        Ok(config) => {
            if json {
                match serde_json::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => {
                        println!(r#"{{"status":"error","message":"{}"}}"#, e);
                        return ExitCode::FAILURE;
                    },
                }
            } else {
                println!("\x1b[32m[OK]\x1b[0m {} is valid", path.display());
            }
            ExitCode::SUCCESS
        },
        Err(e) => {
            if json {
                println!(r#"{{"status":"error","message":"{}"}}"#, e);
            } else {
                println!("\x1b[31m[FAIL]\x1b[0m {}: {}", path.display(), e);
            }
            ExitCode::FAILURE
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let json_output = cli.format == "json";

    // Initialize logging (suppress for JSON output)
    if json_output {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_target(false)
            .init();
    } else if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .init();
    }

    match cli.command {
        Some(Commands::Info) => {
            show_system_info();
            ExitCode::SUCCESS
        },
        Some(Commands::Simulate(args)) => match run_simulation(&args).await {
            Ok((record, verified)) => {
                if json_output {
                    match record.to_json() {
                        Ok(s) => println!("{}", s),
                        Err(e) => {
                            println!(r#"{{"status":"error","message":"{}"}}"#, e);
                            return ExitCode::FAILURE;
                        },
                    }
                } else {
                    print_evidence(&record, verified);
                }
                if verified {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                if json_output {
                    println!(r#"{{"status":"error","message":"{}"}}"#, e);
                } else {
                    println!("\x1b[31m[FAIL]\x1b[0m Simulation failed: {}", e);
                }
                ExitCode::FAILURE
            },
        },
        Some(Commands::CheckConfig { path }) => check_config(&path, json_output),
        None => {
            println!("keywitness {}", VERSION);
            println!();
            println!("  keywitness info          Show trust anchor capabilities");
            println!("  keywitness simulate      Run a simulated session");
            println!("  keywitness check-config  Validate a configuration file");
            ExitCode::SUCCESS
        },
    }
}
