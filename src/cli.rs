//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Payments MCP Gateway - agent certificate authority
#[derive(Parser, Debug)]
#[command(name = "payments-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PAYMENTS_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override `mtls.cert_path`
    #[arg(long, env = "PAYMENTS_GATEWAY_CERT_PATH", global = true)]
    pub cert_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "PAYMENTS_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PAYMENTS_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Output format for command results
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub format: OutputFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// One JSON document on stdout
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Certificate authority commands
    #[command(subcommand)]
    Ca(CaCommand),

    /// Issue a certificate for an agent (reuses an unexpired one)
    Issue {
        /// Agent identifier (becomes the certificate Common Name)
        #[arg(required = true)]
        agent_id: String,

        /// Organization (O)
        #[arg(long)]
        organization: Option<String>,

        /// Organizational unit (OU)
        #[arg(long)]
        organizational_unit: Option<String>,

        /// Contact email
        #[arg(long)]
        email: Option<String>,
    },

    /// Revoke an agent's certificate
    Revoke {
        /// Agent identifier
        #[arg(required = true)]
        agent_id: String,
    },

    /// Show the status of an agent's certificate
    Status {
        /// Agent identifier
        #[arg(required = true)]
        agent_id: String,
    },

    /// List every agent certificate with its status
    List,

    /// Validate a PEM certificate presented for an agent
    Validate {
        /// Agent identifier the certificate claims
        #[arg(required = true)]
        agent_id: String,

        /// Path to the PEM certificate
        #[arg(required = true)]
        certificate: PathBuf,
    },
}

/// Certificate authority subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create the authority if it does not exist yet
    Init,

    /// Show the authority certificate
    Show {
        /// Print the PEM instead of a summary
        #[arg(long)]
        pem: bool,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_issue_with_subject_attributes() {
        let cli = Cli::parse_from([
            "payments-gateway",
            "issue",
            "agent-1",
            "--organization",
            "Acme",
            "--format",
            "json",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::Issue {
                agent_id,
                organization,
                email,
                ..
            } => {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(organization.as_deref(), Some("Acme"));
                assert!(email.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_ca_show_pem() {
        let cli = Cli::parse_from(["payments-gateway", "ca", "show", "--pem"]);
        assert!(matches!(cli.command, Command::Ca(CaCommand::Show { pem: true })));
    }
}
