mod args;
mod driver;
mod logging;
mod model;
mod oracle;

use clap::Parser;

use crate::args::{Args, SimConfig};
use crate::oracle::Oracle;

fn main() {
    let args = Args::parse();
    let config = SimConfig::from_args(args);
    let log_path = logging::init(config.log_dir.as_deref(), config.seed).unwrap_or_else(|err| {
        eprintln!("failed to open log file: {err}");
        std::process::exit(1);
    });

    let config_json = serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string());
    tracing::info!("config: {}", config_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        });

    let report = match runtime.block_on(driver::run(&config)) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "simulation aborted");
            std::process::exit(1);
        }
    };

    if let Err(reason) = Oracle::check(&report, &config) {
        tracing::error!(seed = config.seed, log = ?log_path, "property violated: {reason}");
        std::process::exit(1);
    }
    tracing::info!(
        seed = config.seed,
        prepares = report.counts.prepares,
        begins = report.counts.begins,
        "complete"
    );
}
