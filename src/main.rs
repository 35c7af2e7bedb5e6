//! blockhost-virt - provision and retire BlockHost VMs on a libvirt/KVM host
//!
//! Three entry points share one configuration and one VM database: `create`
//! runs the provisioning saga, `gc` garbage-collects expired VMs in two
//! phases, and `resume` reactivates a suspended VM. All hypervisor and host
//! network mutation goes through the action gateway.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod cloudinit;
mod config;
mod create;
mod domain_xml;
mod error;
mod exec;
mod gateway;
mod gc;
mod qemu_img;
mod resume;
mod store;
#[cfg(test)]
mod testutil;

use error::ProvisionError;
use gateway::ActionRunner;

/// Provision and retire VMs tied to on-chain access credentials.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[clap(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a VM (dry-run unless --apply)
    Create(create::CreateOpts),

    /// Garbage collect expired VMs (dry-run unless --execute)
    Gc(gc::GcOpts),

    /// Resume a suspended VM
    Resume(resume::ResumeOpts),

    /// Execute one gateway action by name (the interface the engine drives)
    Action(ActionOpts),
}

#[derive(Parser)]
struct ActionOpts {
    /// Action name, e.g. domain-start
    name: String,

    /// Parameters as a JSON object
    #[clap(long, default_value = "{}")]
    params: String,
}

/// Install and configure the tracing/logging system.
///
/// Structured logging to stderr with environment-based filtering, defaulting
/// to 'info', so JSON output on stdout stays machine-readable.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn run(cli: Cli) -> Result<(), ProvisionError> {
    let cfg = config::Config::load(&cli.config)?;
    let mut store =
        store::YamlStore::open(cfg.state_file(), cfg.ip_pool.clone(), cfg.ipv6.clone())?;
    let gateway = gateway::Gateway::new(cfg.artifact_root.clone());

    match cli.command {
        Commands::Create(opts) => {
            let summary = create::run(&cfg, &mut store, &gateway, &create::ExternalTools, &opts)?;
            println!("{}", to_json(&summary)?);
        }
        Commands::Gc(opts) => {
            let report = gc::run(&cfg, &mut store, &gateway, &opts)?;
            println!(
                "Suspend: {} candidates ({} suspended)",
                report.suspend_candidates, report.suspended
            );
            println!(
                "Destroy: {} candidates ({} destroyed)",
                report.destroy_candidates, report.destroyed
            );
            if !report.executed {
                println!("(dry-run, use --execute to apply)");
            }
        }
        Commands::Resume(opts) => {
            let report = resume::run(&mut store, &gateway, &opts)?;
            println!("{}", to_json(&report)?);
        }
        Commands::Action(opts) => {
            let params: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&opts.params).map_err(|e| {
                    ProvisionError::Configuration(format!("invalid --params JSON: {e}"))
                })?;
            let action = gateway::Action::parse(&opts.name, &params)?;
            let output = gateway.execute(&action)?;
            println!(
                "{}",
                serde_json::json!({ "status": "ok", "output": output.stdout })
            );
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ProvisionError> {
    serde_json::to_string(value).map_err(|e| ProvisionError::Store(e.to_string()))
}

fn main() -> ExitCode {
    install_tracing();
    if let Err(e) = color_eyre::install() {
        tracing::warn!("could not install error reporting: {e}");
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let body = serde_json::json!({
                "status": "error",
                "error": err.to_string(),
            });
            println!("{body}");
            ExitCode::FAILURE
        }
    }
}
