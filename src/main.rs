//! Payments MCP Gateway - agent certificate authority CLI
//!
//! Creates the gateway's root CA and issues, revokes, inspects and validates
//! agent certificates stored under `mtls.cert_path`.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, error};

use payments_mcp_gateway::{
    cli::{CaCommand, Cli, Command, OutputFormat},
    config::Config,
    mtls::{AgentInfo, CertificateManager, CertificateStatus},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(cert_path) = cli.cert_path {
        config.mtls.cert_path = cert_path;
    }
    debug!(cert_path = %config.mtls.resolved_cert_path().display(), "Opening certificate store");

    let manager =
        CertificateManager::open(&config.mtls).context("Failed to open certificate authority")?;
    let format = cli.format;

    match cli.command {
        Command::Ca(CaCommand::Init | CaCommand::Show { pem: false }) => {
            let ca = manager.authority();
            let info = ca.info();
            let summary = CaSummary {
                common_name: ca.common_name(),
                fingerprint: info.fingerprint(),
                not_before: info.not_before.to_rfc3339(),
                not_after: info.not_after.to_rfc3339(),
                next_serial: ca.peek_next_serial(),
                cert_path: ca.storage().root().display().to_string(),
            };
            print_output(format, &summary, || {
                println!("CA:           {}", summary.common_name);
                println!("Fingerprint:  {}", summary.fingerprint);
                println!("Valid from:   {}", summary.not_before);
                println!("Valid until:  {}", summary.not_after);
                println!("Next serial:  {}", summary.next_serial);
                println!("Storage:      {}", summary.cert_path);
            })?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Ca(CaCommand::Show { pem: true }) => {
            print!("{}", manager.authority().certificate_pem());
            Ok(ExitCode::SUCCESS)
        }

        Command::Issue {
            agent_id,
            organization,
            organizational_unit,
            email,
        } => {
            let agent_info = AgentInfo {
                organization,
                organizational_unit,
                email,
            };
            let cert = manager.issue(&agent_id, agent_info).await?;
            let status = cert.status_at(chrono::Utc::now());
            let dir = manager.authority().storage().agent_dir(&agent_id);
            print_output(format, &status, || {
                print_status_table(std::slice::from_ref(&status));
                println!("\nFiles: {}", dir.display());
            })?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Revoke { agent_id } => {
            let revoked = manager.revoke(&agent_id).await?;
            let outcome = RevokeOutcome {
                agent_id: &agent_id,
                revoked,
            };
            print_output(format, &outcome, || {
                if revoked {
                    println!("✅ Revoked certificate of {agent_id}");
                } else {
                    println!("No certificate held for {agent_id}");
                }
            })?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Status { agent_id } => match manager.status(&agent_id) {
            Some(status) => {
                print_output(format, &status, || {
                    print_status_table(std::slice::from_ref(&status));
                })?;
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("No certificate held for {agent_id}");
                Ok(ExitCode::FAILURE)
            }
        },

        Command::List => {
            let statuses = manager.list_statuses();
            print_output(format, &statuses, || {
                if statuses.is_empty() {
                    println!("No agent certificates issued.");
                } else {
                    print_status_table(&statuses);
                }
            })?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate {
            agent_id,
            certificate,
        } => {
            let pem = std::fs::read(&certificate)
                .with_context(|| format!("Cannot read '{}'", certificate.display()))?;
            let outcome = match manager.check(&pem, &agent_id) {
                Ok(info) => ValidateOutcome {
                    agent_id: &agent_id,
                    valid: true,
                    serial_number: Some(info.serial_number),
                    reason: None,
                },
                Err(failure) => ValidateOutcome {
                    agent_id: &agent_id,
                    valid: false,
                    serial_number: None,
                    reason: Some(failure.as_str()),
                },
            };
            print_output(format, &outcome, || {
                if outcome.valid {
                    println!("✅ valid for {agent_id}");
                } else {
                    println!("❌ invalid for {agent_id}: {}", outcome.reason.unwrap_or_default());
                }
            })?;
            Ok(if outcome.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[derive(Serialize)]
struct CaSummary<'a> {
    common_name: &'a str,
    fingerprint: String,
    not_before: String,
    not_after: String,
    next_serial: u64,
    cert_path: String,
}

#[derive(Serialize)]
struct RevokeOutcome<'a> {
    agent_id: &'a str,
    revoked: bool,
}

#[derive(Serialize)]
struct ValidateOutcome<'a> {
    agent_id: &'a str,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

fn print_output<T: Serialize>(
    format: OutputFormat,
    value: &T,
    table: impl FnOnce(),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
            println!("{json}");
        }
        OutputFormat::Table => table(),
    }
    Ok(())
}

fn print_status_table(statuses: &[CertificateStatus]) {
    let width = statuses
        .iter()
        .map(|s| s.agent_id.len())
        .max()
        .unwrap_or(0)
        .max("AGENT".len());
    println!(
        "{:<width$}  {:>8}  {:<13}  {:<25}  {:>10}",
        "AGENT", "SERIAL", "STATUS", "EXPIRES", "DAYS LEFT"
    );
    for s in statuses {
        println!(
            "{:<width$}  {:>8}  {:<13}  {:<25}  {:>10}",
            s.agent_id,
            s.serial_number,
            s.status.to_string(),
            s.expires_at.to_rfc3339(),
            s.expires_in_secs / 86_400
        );
    }
}
