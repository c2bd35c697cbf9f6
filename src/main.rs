use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use certmgr::config::Config;
use certmgr::orchestrator;
use certmgr::CertificateContext;

/// Automated ACME v2 certificate manager.
#[derive(Parser, Debug)]
#[command(name = "certmgr", version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/certmgr/certmgr.yml")]
    config: PathBuf,

    /// Override the configured resource directory (account key,
    /// registration, nonce bookkeeping).
    #[arg(long)]
    resource_dir: Option<PathBuf>,

    /// Compute decisions and log them without contacting the ACME
    /// service or writing any files.
    #[arg(long)]
    dry_run: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "certmgr=info",
        1 => "certmgr=debug",
        _ => "certmgr=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "unable to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(resource_dir) = args.resource_dir {
        config.resource_dir = resource_dir;
    }

    if args.dry_run {
        for (name, spec) in config.certificate_specs() {
            let ctx = match CertificateContext::load(name.clone(), spec, &config.cert_dir) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::error!(name, error = %e, "unable to load certificate state");
                    return ExitCode::FAILURE;
                }
            };
            for item in ctx.iter() {
                let decision = orchestrator::decide(item, &ctx.spec);
                tracing::info!(name = %ctx.name, key_type = %item.key_type, decision = ?decision, "dry run: decision");
            }
        }
        return ExitCode::SUCCESS;
    }

    match orchestrator::run(&config).await {
        Ok((fatal_errors, validation_errors)) => {
            if validation_errors > 0 {
                tracing::warn!(validation_errors, "completed with validation errors");
            }
            if fatal_errors > 0 {
                tracing::error!(fatal_errors, "completed with fatal errors in one or more contexts");
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "unable to start");
            ExitCode::FAILURE
        }
    }
}
