use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;

use forge_core::anchors::{create_anchor, maybe_publish_anchor_witness, verify_receipt_anchors};
use forge_core::controller::evaluate_integrity;
use forge_core::observatory::rebuild_index;
use forge_core::policy_fingerprint::{build_policy_dict, compute_policy_hash};
use forge_core::orchestrator::tick;
use forge_core::receipts::{rebuild_receipts_index, verify_receipt_chain};
use forge_core::replay::{replay, ReplayArgs};
use forge_core::status::{build_status_payload, status_exit_code};
use forge_core::CoreContext;
use sos_audit::doctor::{run_doctor, DoctorOptions};
use sos_config::paths;
use sos_governor::verify_pressure_state_chain;
use sos_policy::{acknowledge_quarantine, clear_quarantine, load_quarantine};
use sos_provenance::{export_bundle, verify_bundle, WindowSelection};

/// Forge integrity substrate CLI
#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "Tamper-evident integrity and attestation substrate")]
#[command(version = "1.0.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Integrity status summary
    Status {
        /// Print canonical JSON summary
        #[arg(long)]
        json: bool,
        /// Print human summary
        #[arg(long)]
        latest: bool,
    },

    /// Run one orchestrator tick
    Tick,

    /// Deterministic re-evaluation without mutating publishes
    Replay {
        #[arg(long)]
        verify: bool,
        #[arg(long = "last-n", default_value_t = 25)]
        last_n: usize,
        #[arg(long = "emit-snapshot", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
        emit_snapshot: u8,
        #[arg(long = "write-policy", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
        write_policy: u8,
    },

    /// Verify the merge-receipt hash chain
    VerifyReceiptChain {
        #[arg(long)]
        last: Option<usize>,
        /// Rebuild the derived receipts index first
        #[arg(long)]
        repair_index: bool,
    },

    /// Verify signed receipt anchors
    VerifyReceiptAnchors {
        #[arg(long)]
        last: Option<usize>,
        /// Require the newest anchor to cover the current receipt tip
        #[arg(long)]
        require_tip: bool,
    },

    /// Create a signed anchor over the current receipt tip
    Anchor,

    /// Diagnose and (with explicit consent) repair audit chains
    AuditChainDoctor(DoctorArgs),

    /// Export a deterministic provenance bundle
    ExportProvenanceBundle {
        #[arg(long, default_value = paths::PROVENANCE_DIR)]
        dir: PathBuf,
        #[arg(long, default_value = paths::BUNDLES_DIR)]
        out: PathBuf,
        #[arg(long, default_value_t = 50)]
        last: usize,
        #[arg(long = "from")]
        from_ts: Option<String>,
        #[arg(long = "to")]
        to_ts: Option<String>,
        #[arg(long = "archive-index", default_value = paths::ARCHIVE_INDEX)]
        archive_index: PathBuf,
    },

    /// Verify a provenance bundle archive
    VerifyProvenanceBundle {
        bundle: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Verify the governor pressure-state snapshot chain
    VerifyPressureStateChain {
        state_dir: PathBuf,
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Quarantine state operations
    #[command(subcommand)]
    Quarantine(QuarantineCommands),

    /// Rebuild the observatory index from primary artifacts
    RebuildIndex,
}

#[derive(Args)]
struct DoctorArgs {
    #[arg(long)]
    diagnose_only: bool,
    #[arg(long)]
    repair_index_only: bool,
    #[arg(long)]
    truncate_after_break: bool,
    #[arg(long)]
    rebuild_missing_prev_links: bool,
    #[arg(long = "i-understand")]
    i_understand: bool,
}

#[derive(Subcommand)]
enum QuarantineCommands {
    /// Print the quarantine state
    Status,
    /// Append an acknowledgement note (does not deactivate)
    Ack { note: String },
    /// Deactivate and restore permissive toggles
    Clear { note: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let ctx = CoreContext::new(&root);

    match run(&ctx, cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(4)
        }
    }
}

fn run(ctx: &CoreContext, command: Commands) -> Result<u8> {
    match command {
        Commands::Status { json, latest } => {
            let payload = build_status_payload(ctx)?;
            if json || !latest {
                print_canonical(&payload)?;
            } else {
                print_human_status(&payload);
            }
            Ok(status_exit_code(&payload) as u8)
        }

        Commands::Tick => {
            let report = tick(ctx).context("tick failed")?;
            print_canonical(&report.to_value())?;
            Ok(0)
        }

        Commands::Replay {
            verify,
            last_n,
            emit_snapshot,
            write_policy,
        } => {
            let payload = replay(
                ctx,
                &ReplayArgs {
                    verify,
                    last_n,
                    emit_snapshot: emit_snapshot == 1,
                    write_policy: write_policy == 1,
                },
            )
            .context("replay failed")?;
            print_canonical(&payload)?;
            Ok(0)
        }

        Commands::VerifyReceiptChain { last, repair_index } => {
            if repair_index {
                rebuild_receipts_index(&ctx.root)?;
            }
            let verification = verify_receipt_chain(&ctx.root, last);
            print_canonical(&verification.to_value())?;
            Ok(if verification.status == sos_chain::VerificationStatus::Broken {
                1
            } else {
                0
            })
        }

        Commands::VerifyReceiptAnchors { last, require_tip } => {
            let verification = verify_receipt_anchors(&ctx.root, &ctx.env, last, require_tip)?;
            print_canonical(&verification.to_value())?;
            Ok(if verification.ok() { 0 } else { 1 })
        }

        Commands::Anchor => {
            let anchor = create_anchor(&ctx.root, &ctx.env)?;
            // The git witness backend may only tag when mutation is allowed.
            let policy_hash = compute_policy_hash(&build_policy_dict(&ctx.env))?;
            let status = evaluate_integrity(ctx, &policy_hash, None)?;
            let witness =
                maybe_publish_anchor_witness(&ctx.root, &ctx.env, status.mutation_allowed)?;
            print_canonical(&json!({"anchor": anchor, "witness": witness}))?;
            Ok(0)
        }

        Commands::AuditChainDoctor(args) => {
            let outcome = run_doctor(
                &ctx.root,
                DoctorOptions {
                    diagnose_only: args.diagnose_only,
                    repair_index_only: args.repair_index_only,
                    truncate_after_break: args.truncate_after_break,
                    rebuild_missing_prev_links: args.rebuild_missing_prev_links,
                    i_understand: args.i_understand,
                },
            )?;
            print_canonical(&outcome.payload)?;
            Ok(if outcome.success { 0 } else { 1 })
        }

        Commands::ExportProvenanceBundle {
            dir,
            out,
            last,
            from_ts,
            to_ts,
            archive_index,
        } => {
            anyhow::ensure!(last > 0, "--last must be > 0");
            let selection = match (from_ts, to_ts) {
                (Some(from), Some(to)) => WindowSelection::Range { from, to },
                (None, None) => WindowSelection::Last(last),
                _ => anyhow::bail!("--from and --to must be provided together"),
            };
            let export = export_bundle(
                &ctx.root.join(dir),
                &ctx.root.join(out),
                &selection,
                Some(&ctx.root.join(paths::TREND_REPORT)),
                &ctx.root.join(archive_index),
            )?;
            print_canonical(&json!({
                "bundle_path": export.bundle_path.to_string_lossy(),
                "snapshots": export.snapshot_count,
                "manifest": export.manifest,
            }))?;
            Ok(0)
        }

        Commands::VerifyProvenanceBundle { bundle, output } => {
            let summary = verify_bundle(&bundle);
            if let Some(output) = output {
                sos_chain::io::write_json_atomic(&output, &summary)?;
            }
            print_canonical(&summary)?;
            Ok(if summary["verified"] == json!(true) { 0 } else { 1 })
        }

        Commands::VerifyPressureStateChain { state_dir, events } => {
            let result = verify_pressure_state_chain(&state_dir, events.as_deref());
            print_canonical(&result)?;
            Ok(if result["integrity_ok"] == json!(true) { 0 } else { 1 })
        }

        Commands::Quarantine(command) => {
            let state = match command {
                QuarantineCommands::Status => load_quarantine(&ctx.root),
                QuarantineCommands::Ack { note } => acknowledge_quarantine(&ctx.root, &note)?,
                QuarantineCommands::Clear { note } => clear_quarantine(&ctx.root, &note)?,
            };
            print_canonical(&sos_enc::canonical_value(&state)?)?;
            Ok(0)
        }

        Commands::RebuildIndex => {
            let index = rebuild_index(ctx)?;
            print_canonical(&index)?;
            Ok(0)
        }
    }
}

fn print_canonical(payload: &Value) -> Result<()> {
    let bytes = sos_enc::canonical_bytes(payload)?;
    print!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

fn print_human_status(payload: &Value) {
    println!(
        "posture={} mode={} quarantine={} pressure_level={}",
        payload["posture"], payload["mode"], payload["quarantine"], payload["pressure"]["level"]
    );
    println!("integrity_primary_reason={}", payload["integrity_primary_reason"]);
    let allow = &payload["allow"];
    println!(
        "allow mutation={} publish={} automerge={}",
        allow["mutation"], allow["publish"], allow["automerge"]
    );
    println!(
        "budget exhausted={} remaining={}",
        payload["budget"]["exhausted"], payload["budget"]["remaining"]
    );
    println!(
        "snapshot present={} cadence={}",
        payload["snapshot"]["present"], payload["snapshot"]["cadence"]
    );
    println!("signature_verification={}", payload["signature_verification"]);
    println!(
        "policy_hash={} integrity_status_hash={}",
        payload["policy_hash"], payload["integrity_status_hash"]
    );
}
