//! Custodian Runtime
//!
//! Entry point for the self-custody identity manager. Handles CLI
//! args, wires the collaborators together, and drives the
//! provisioning and transfer state machines.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::Input;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use custodian::auth::AuthContext;
use custodian::config::{self, CustodianConfig};
use custodian::directory::{DirectoryHttpClient, DirectoryProbe};
use custodian::provision::{ProvisioningMachine, ProvisionState};
use custodian::state::{Database, StateHandle};
use custodian::transfer::{
    complete_transfer, export_identity, register_export, ImportError, ImportMachine,
};
use custodian::types::{DirectoryClient, IdentityVault};
use custodian::vault::FileVault;

const VERSION: &str = "0.1.0";

/// Custodian -- Self-Custody Identity Manager
#[derive(Parser, Debug)]
#[command(
    name = "custodian",
    version = VERSION,
    about = "Custodian -- Self-Custody Identity Manager",
    long_about = "Manages a device-local cryptographic identity: creation, \
                  directory synchronization, and device-to-device transfer."
)]
struct Cli {
    /// Create the identity if missing and reconcile with the directory
    #[arg(long)]
    init: bool,

    /// Show current identity and session status
    #[arg(long)]
    status: bool,

    /// Re-run directory sync and sign-in for an existing identity
    #[arg(long)]
    sync: bool,

    /// Export the identity as a transfer payload (prints payload + code)
    #[arg(long)]
    export: bool,

    /// Import an identity from a transfer payload read from stdin
    #[arg(long)]
    import: bool,

    /// Confirm a finished transfer on the source device
    #[arg(long)]
    complete_transfer: bool,
}

struct Runtime {
    config: CustodianConfig,
    vault: Arc<FileVault>,
    directory: Arc<DirectoryHttpClient>,
    probe: Arc<DirectoryProbe>,
    auth: Arc<AuthContext>,
    store: StateHandle,
}

fn build_runtime() -> Result<Runtime> {
    let config = config::load_config().unwrap_or_else(|| {
        let defaults = config::default_config();
        if let Err(e) = config::save_config(&defaults) {
            warn!("could not write default config: {e:#}");
        }
        defaults
    });

    let vault = Arc::new(FileVault::default_location());
    let directory = Arc::new(DirectoryHttpClient::new(config.directory_url.clone()));
    let probe = Arc::new(DirectoryProbe::new(config.directory_url.clone()));

    let db_path = config::resolve_path(&config.db_path);
    let store = StateHandle::new(Database::open(&db_path).context("Failed to open state database")?);

    let auth = Arc::new(AuthContext::new(directory.clone() as Arc<dyn DirectoryClient>));
    if let Some(session) = store.get_session() {
        auth.set_session(session);
    }

    Ok(Runtime {
        config,
        vault,
        directory,
        probe,
        auth,
        store,
    })
}

// ---- Init / Sync ------------------------------------------------------------

async fn run_init(rt: &Runtime) -> Result<()> {
    let machine = Arc::new(ProvisioningMachine::new(
        rt.vault.clone(),
        rt.directory.clone(),
        rt.probe.clone(),
        rt.auth.clone(),
        rt.store.clone(),
    ));

    let mut state_rx = machine.subscribe_state();
    let watcher = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow().clone();
            match &state {
                ProvisionState::Creating => {
                    println!("{}", "  Creating identity...".cyan())
                }
                ProvisionState::SyncingAndSigningIn | ProvisionState::ReconcilingExisting => {
                    println!("{}", "  Syncing with directory...".cyan())
                }
                ProvisionState::Failed(msg) => {
                    eprintln!("{}", format!("  Failed: {}", msg).red())
                }
                _ => {}
            }
        }
    });

    let cancel = machine.cancel_token();
    let outcome = tokio::select! {
        result = machine.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };
    watcher.abort();

    if outcome.created {
        println!("{}", "  Identity created.".green());
    } else {
        println!("{}", "  Identity already present.".green());
    }
    if outcome.synced {
        println!("{}", "  Directory: synced".green());
    } else {
        println!(
            "{}",
            "  Directory: not synced (offline or unreachable); will retry later".yellow()
        );
    }
    Ok(())
}

// ---- Status ------------------------------------------------------------------

fn show_status(rt: &Runtime) {
    match rt.vault.load_identity() {
        Some(identity) => {
            println!(
                r#"
=== CUSTODIAN STATUS ===
Public ID:  {}
Public key: {}
Created:    {}
Session:    {}
Synced:     {}
Directory:  {}
========================
"#,
                identity.public_id,
                identity.public_key,
                identity.created_at,
                rt.store
                    .get_session()
                    .map(|s| s.id)
                    .unwrap_or_else(|| "none".to_string()),
                rt.store.session_synced(),
                rt.config.directory_url,
            );
        }
        None => {
            println!("No identity on this device. Run: custodian --init");
        }
    }
}

// ---- Export ------------------------------------------------------------------

fn run_export(rt: &Runtime) -> Result<()> {
    let device_id = rt.store.device_id();
    let bundle = export_identity(
        rt.vault.as_ref(),
        &device_id,
        rt.config.transfer_ttl_minutes,
    )?;

    register_export(&rt.store, &bundle);

    let payload = serde_json::to_string(&bundle.payload)?;
    println!("{}", "Transfer payload (render as a QR code):".cyan());
    println!("{}", payload);
    println!();
    println!(
        "{}",
        format!("Transfer code (communicate out-of-band): {}", bundle.code).green()
    );
    println!(
        "{}",
        format!(
            "The payload expires in {} minutes. Never send the code alongside the payload.",
            rt.config.transfer_ttl_minutes
        )
        .yellow()
    );
    Ok(())
}

// ---- Import ------------------------------------------------------------------

async fn run_import(rt: &Runtime) -> Result<()> {
    let machine = ImportMachine::new(
        rt.vault.clone() as Arc<dyn IdentityVault>,
        rt.probe.clone(),
        rt.auth.clone(),
        rt.store.clone(),
    );

    let raw: String = Input::new()
        .with_prompt(format!(
            "  {} {}",
            "\u{2192}".cyan(),
            "Paste the transfer payload".white()
        ))
        .interact_text()?;

    machine
        .handle_scan(raw.trim())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    loop {
        let code: String = Input::new()
            .with_prompt(format!(
                "  {} {}",
                "\u{2192}".cyan(),
                "Enter the 6-character transfer code".white()
            ))
            .interact_text()?;

        match machine.submit_code(&code).await {
            Ok(completion) => {
                println!("{}", "  Identity imported.".green());
                if completion.source_notified {
                    println!("{}", "  Source device notified.".green());
                } else {
                    println!(
                        "{}",
                        "  Could not notify the source device; remove the identity there manually."
                            .yellow()
                    );
                }
                return Ok(());
            }
            Err(ImportError::CodeRejected) => {
                eprintln!("{}", "  Transfer codes are exactly 6 characters.".yellow());
            }
            Err(ImportError::ImportFailed(msg)) => {
                eprintln!("{}", format!("  Import failed: {}. Try again.", msg).red());
            }
            Err(err) => return Err(anyhow::anyhow!("{err}")),
        }
    }
}

// ---- Complete Transfer -------------------------------------------------------

fn run_complete_transfer(rt: &Runtime) -> Result<()> {
    let transfer_id: String = Input::new()
        .with_prompt(format!("  {} {}", "\u{2192}".cyan(), "Transfer id".white()))
        .interact_text()?;
    let code: String = Input::new()
        .with_prompt(format!("  {} {}", "\u{2192}".cyan(), "Transfer code".white()))
        .interact_text()?;

    let device_id = rt.store.device_id();
    complete_transfer(&rt.store, &device_id, transfer_id.trim(), &code)?;

    println!("{}", "  Transfer confirmed.".green());
    println!(
        "{}",
        "  The identity now lives on the other device. Remove it from this \
         device when you are ready; that step is never automatic."
            .yellow()
    );
    Ok(())
}

// ---- Entry Point -------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = if cli.status {
        show_status(&rt);
        Ok(())
    } else if cli.export {
        run_export(&rt)
    } else if cli.import {
        run_import(&rt).await
    } else if cli.complete_transfer {
        run_complete_transfer(&rt)
    } else if cli.init || cli.sync {
        run_init(&rt).await
    } else {
        eprintln!(
            "Nothing to do. Try: custodian --init | --status | --export | --import | --complete-transfer"
        );
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}
