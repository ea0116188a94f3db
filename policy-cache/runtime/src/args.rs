use crate::churn;
use anyhow::{anyhow, bail, Result};
use clap::{Parser, ValueEnum};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "policy-cache",
    about = "Exercises the selector policy cache under endpoint churn"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "policy_cache=info,warn",
        env = "POLICY_CACHE_LOG"
    )]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    /// Number of workload identities, in addition to the host.
    #[clap(long, default_value = "64")]
    identities: u32,

    #[clap(long, default_value = "2")]
    endpoints_per_identity: u32,

    /// Number of concurrent regeneration workers.
    #[clap(long, default_value = "8")]
    workers: usize,

    /// Number of regeneration rounds run by each worker.
    #[clap(long, default_value = "200")]
    rounds: u32,

    /// Bumps the repository revision every N rounds of each worker. Zero disables bumps.
    #[clap(long, default_value = "10")]
    revision_bump_every: u32,

    /// Percentage of rounds that remove (or restore) an endpoint instead of regenerating it.
    #[clap(long, default_value = "5")]
    removal_percent: u8,

    /// Percentage of policy resolutions that fail.
    #[clap(long, default_value = "0")]
    failure_percent: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            identities,
            endpoints_per_identity,
            workers,
            rounds,
            revision_bump_every,
            removal_percent,
            failure_percent,
        } = self;

        init_tracing(&log_level, log_format)?;

        let config = churn::Config {
            identities,
            endpoints_per_identity,
            workers,
            rounds,
            revision_bump_every,
            removal_percent,
            failure_percent,
        };
        validate(&config)?;

        let mut prom = <Registry>::default();
        churn::run(config, &mut prom).await?;

        let mut metrics = String::new();
        encode(&mut metrics, &prom)?;
        print!("{metrics}");
        Ok(())
    }
}

fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!(error))
}

fn validate(config: &churn::Config) -> Result<()> {
    if config.workers == 0 {
        bail!("--workers must be > 0");
    }
    if config.removal_percent > 100 {
        bail!("--removal-percent must be 0-100");
    }
    if config.failure_percent > 100 {
        bail!("--failure-percent must be 0-100");
    }
    Ok(())
}
