//! certgate - mTLS authenticating gateway
//!
//! Terminates TLS, requires a client certificate checked against the
//! configured revocation strategy, and forwards authenticated requests to a
//! backend with the certificate's Common Name in `X-ClientID`.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use num_bigint::BigUint;
use tracing::{error, info};

use certgate::{
    cli::{Cli, Command, TlsCommand},
    config::Config,
    gateway::Gateway,
    mtls::{
        CaParams, CertGenerator, ClientCertificate, CrlParams, LeafCertParams, RevokedEntry,
        load_certs,
    },
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

    match cli.command {
        Some(Command::Tls(tls_cmd)) => run_tls_command(tls_cmd),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run certificate authority helpers
fn run_tls_command(cmd: TlsCommand) -> ExitCode {
    match cmd {
        TlsCommand::InitCa { cn, days, out } => {
            let params = CaParams {
                cn: &cn,
                validity_days: days,
            };
            match CertGenerator::init_ca(&params)
                .and_then(|ca| CertGenerator::write_to_dir(&ca, &out, "ca"))
            {
                Ok(()) => {
                    println!("✅ CA '{cn}' written to {}", out.join("ca.crt").display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to create CA: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        TlsCommand::Issue {
            cn,
            ca_cert,
            ca_key,
            crl_urls,
            dns,
            ips,
            client,
            serial,
            days,
            out,
            name,
        } => {
            let (ca_cert_pem, ca_key_pem) = match read_ca(&ca_cert, &ca_key) {
                Ok(ca) => ca,
                Err(code) => return code,
            };
            let params = LeafCertParams {
                cn: &cn,
                san_dns: dns,
                san_ips: ips,
                crl_urls,
                serial,
                client,
                validity_days: days,
            };
            let stem = name.unwrap_or_else(|| cn.clone());
            match CertGenerator::issue_leaf(&params, &ca_cert_pem, &ca_key_pem)
                .and_then(|leaf| CertGenerator::write_to_dir(&leaf, &out, &stem))
            {
                Ok(()) => {
                    let kind = if client { "client" } else { "server" };
                    println!(
                        "✅ {kind} certificate '{cn}' written to {}",
                        out.join(format!("{stem}.crt")).display()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to issue certificate: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        TlsCommand::Revoke {
            ca_cert,
            ca_key,
            serials,
            next_update,
            crl_number,
            out,
        } => {
            let (ca_cert_pem, ca_key_pem) = match read_ca(&ca_cert, &ca_key) {
                Ok(ca) => ca,
                Err(code) => return code,
            };
            let next_update = match chrono::Duration::from_std(next_update) {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("❌ Invalid --next-update: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let params = CrlParams {
                revoked: serials
                    .iter()
                    .map(|serial| RevokedEntry {
                        serial: BigUint::from(*serial),
                        reason: None,
                    })
                    .collect(),
                next_update,
                crl_number,
            };
            let written = CertGenerator::issue_crl(&params, &ca_cert_pem, &ca_key_pem)
                .and_then(|crl| std::fs::write(&out, crl).map_err(Into::into));
            match written {
                Ok(()) => {
                    println!(
                        "✅ CRL #{crl_number} with {} revoked serial(s) written to {}",
                        serials.len(),
                        out.display()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to write CRL: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        TlsCommand::Show { cert } => {
            let parsed = load_certs(&cert.to_string_lossy()).and_then(|certs| {
                let leaf = certs.first().ok_or_else(|| {
                    certgate::Error::CertificateLoad(format!(
                        "No certificates found in '{}'",
                        cert.display()
                    ))
                })?;
                ClientCertificate::from_der(leaf)
            });
            match parsed {
                Ok(leaf) => {
                    println!("Common Name: {}", leaf.common_name().unwrap_or("(none)"));
                    println!("Serial:      {} (0x{:x})", leaf.serial(), leaf.serial());
                    if leaf.crl_distribution_points().is_empty() {
                        println!("CRL DPs:     (none)");
                    } else {
                        for url in leaf.crl_distribution_points() {
                            println!("CRL DP:      {url}");
                        }
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to read certificate: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn read_ca(cert: &Path, key: &Path) -> Result<(String, String), ExitCode> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|e| {
            eprintln!("❌ Cannot read {}: {e}", path.display());
            ExitCode::FAILURE
        })
    };
    Ok((read(cert)?, read(key)?))
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(ref listen) = cli.listen {
                config.server.listen_addr = listen.clone();
            }
            if let Some(ref backend) = cli.backend {
                config.forward.base_url = backend.clone();
            }
            if cli.proxy {
                config.egress.proxy_enabled = true;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        backend = %config.forward.base_url,
        revocation = %config.revocation.strategy,
        "Starting certgate"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!(kind = e.kind(), "Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
