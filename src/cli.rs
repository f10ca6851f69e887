//! Command-line interface

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// certgate - mTLS authenticating gateway
#[derive(Parser, Debug)]
#[command(name = "certgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERTGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides server.listen_addr)
    #[arg(short, long, env = "CERTGATE_LISTEN")]
    pub listen: Option<String>,

    /// Backend base URL (overrides forward.base_url)
    #[arg(short, long, env = "CERTGATE_BACKEND")]
    pub backend: Option<String>,

    /// Route outbound calls through `HTTPS_PROXY` / `HTTP_PROXY`
    #[arg(long, env = "CERTGATE_PROXY")]
    pub proxy: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CERTGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CERTGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Certificate authority helpers
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a self-signed CA able to sign certificates and CRLs
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "certgate Root CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory; writes `ca.crt` and `ca.key`
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Issue a server or client certificate signed by the CA
    Issue {
        /// Common Name; for client certificates this becomes `X-ClientID`
        #[arg(long, required = true)]
        cn: String,

        /// CA certificate (PEM)
        #[arg(long, default_value = "ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// CRL distribution point URL (repeatable)
        #[arg(long = "crl-url")]
        crl_urls: Vec<String>,

        /// DNS Subject Alternative Name (repeatable)
        #[arg(long = "dns")]
        dns: Vec<String>,

        /// IP Subject Alternative Name (repeatable)
        #[arg(long = "ip")]
        ips: Vec<IpAddr>,

        /// Issue a client certificate instead of a server certificate
        #[arg(long)]
        client: bool,

        /// Explicit serial number
        #[arg(long)]
        serial: Option<u64>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Output directory; writes `<name>.crt` and `<name>.key`
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// File stem (defaults to the Common Name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Write a CRL signed by the CA
    Revoke {
        /// CA certificate (PEM)
        #[arg(long, default_value = "ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// Serial number to list as revoked (repeatable; none = empty CRL)
        #[arg(long = "serial")]
        serials: Vec<u64>,

        /// Time until nextUpdate (e.g. "24h", "30m")
        #[arg(long, default_value = "24h", value_parser = humantime_serde::parse)]
        next_update: Duration,

        /// CRL number
        #[arg(long, default_value_t = 1)]
        crl_number: u64,

        /// Output file (DER)
        #[arg(short, long, default_value = "ca.crl")]
        out: PathBuf,
    },

    /// Print the Common Name, serial and CRL distribution points of a certificate
    Show {
        /// Certificate file (PEM)
        #[arg(required = true)]
        cert: PathBuf,
    },
}
