use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deterministic sql-session workload simulator")]
pub(crate) struct Args {
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 16)]
    pub(crate) tasks: usize,
    /// Distinct SQL templates the workload draws from.
    #[arg(long, default_value_t = 24)]
    pub(crate) templates: usize,
    /// Statement cache capacity; 0 means unbounded.
    #[arg(long, default_value_t = 16)]
    pub(crate) cache_size: usize,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) cache_ttl: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1ms")]
    pub(crate) prepare_delay: Duration,
    #[arg(long, default_value_t = 0.01)]
    pub(crate) break_rate: f64,
    #[arg(long, default_value_t = 0.02)]
    pub(crate) fail_rate: f64,
    #[arg(long, default_value_t = 0.15)]
    pub(crate) tx_rate: f64,
    #[arg(long, default_value_t = 0.10)]
    pub(crate) derive_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) sleep_rate: f64,
    /// Directory for per-seed log files.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) iterations: u64,
    pub(crate) seed: u64,
    pub(crate) tasks: usize,
    pub(crate) templates: usize,
    pub(crate) cache_size: usize,
    pub(crate) cache_ttl_ms: Option<u64>,
    pub(crate) prepare_delay_ms: u64,
    pub(crate) break_rate: f64,
    pub(crate) fail_rate: f64,
    pub(crate) tx_rate: f64,
    pub(crate) derive_rate: f64,
    pub(crate) sleep_rate: f64,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) preset: Option<String>,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let mut config = SimConfig {
            iterations: args.iterations.unwrap_or(5_000),
            seed: args.seed.unwrap_or_else(random_seed),
            tasks: args.tasks.max(1),
            templates: args.templates.max(1),
            cache_size: args.cache_size,
            cache_ttl_ms: args.cache_ttl.map(|d| d.as_millis() as u64),
            prepare_delay_ms: args.prepare_delay.as_millis() as u64,
            break_rate: clamp_rate(args.break_rate),
            fail_rate: clamp_rate(args.fail_rate),
            tx_rate: clamp_rate(args.tx_rate),
            derive_rate: clamp_rate(args.derive_rate),
            sleep_rate: clamp_rate(args.sleep_rate),
            log_dir: args.log_dir,
            preset: None,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = 1_000;
        self.tasks = 4;
        self.templates = 8;
        self.cache_size = 4;
        self.break_rate = 0.01;
        self.fail_rate = 0.01;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = 100_000;
        self.tasks = 64;
        self.templates = 64;
        self.cache_size = 24;
        self.break_rate = 0.03;
        self.fail_rate = 0.03;
        self.tx_rate = 0.25;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}
