//! gleaner – command-line client for gleaner-server.
//!
//! Results are printed to stdout as JSON; progress lines and logs go to
//! stderr so the output can be piped.

mod client;

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use gleaner_core::{Backoff, JobId, JobParameters, JobStatus, PollConfig, StatusPoller};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::client::HttpJobClient;

#[derive(Parser, Debug)]
#[command(name = "gleaner", version, about = "Submit and follow place-extraction jobs")]
struct Cli {
    /// Base URL of the gleaner-server instance
    #[arg(
        long,
        env = "GLEANER_SERVER",
        default_value = "http://127.0.0.1:3001",
        global = true
    )]
    server: String,

    /// Timeout of a single HTTP request, in seconds
    #[arg(long, default_value_t = 30, global = true)]
    request_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new extraction job
    Submit(SubmitArgs),
    /// Show the current record of a job
    Status { id: String },
    /// Poll a job until it finishes
    Wait {
        id: String,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Cancel a pending or running job
    Cancel { id: String },
    /// List the most recent jobs
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// What to search for, e.g. "restaurant"
    keyword: String,
    /// Where to search
    city: String,
    /// Search radius in kilometres
    #[arg(long, default_value_t = 10)]
    radius: u32,
    /// Maximum number of places to extract
    #[arg(long, default_value_t = 20)]
    max_results: u32,
    /// Follow the job until it finishes
    #[arg(long)]
    wait: bool,
    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Args, Debug, Clone)]
struct PollArgs {
    /// Delay between two status requests (first delay when exponential)
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,
    #[arg(long, value_enum, default_value = "fixed")]
    backoff: BackoffKind,
    /// Growth factor of the exponential backoff
    #[arg(long, default_value_t = 2)]
    multiplier: u32,
    /// Cap on the exponential backoff delay
    #[arg(long, default_value_t = 30_000)]
    max_interval_ms: u64,
    /// Give up after this many status requests
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Give up after this many seconds; 0 waits forever
    #[arg(long, default_value_t = 600)]
    max_elapsed_secs: u64,
}

impl PollArgs {
    fn to_config(&self) -> PollConfig {
        let interval = Duration::from_millis(self.interval_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(interval),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: interval,
                multiplier: self.multiplier.max(1),
                max: Duration::from_millis(self.max_interval_ms).max(interval),
            },
        };

        let mut config = PollConfig::default().with_backoff(backoff);
        config = match self.max_elapsed_secs {
            0 => config.without_max_elapsed(),
            secs => config.with_max_elapsed(Duration::from_secs(secs)),
        };
        if let Some(max) = self.max_attempts {
            config = config.with_max_attempts(max);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = HttpJobClient::new(&cli.server, Duration::from_secs(cli.request_timeout_secs))?;
    debug!(server = %cli.server, "client ready");

    match cli.command {
        Commands::Submit(args) => {
            let params = JobParameters::new(args.keyword, args.city)
                .with_radius(args.radius)
                .with_max_results(args.max_results);
            let accepted = client.submit(&params).await.context("submitting job")?;
            if args.wait {
                eprintln!("submitted {}", accepted.id);
                follow(client, accepted.id, &args.poll).await?;
            } else {
                print_json(&accepted)?;
            }
        }
        Commands::Status { id } => print_json(&client.status(&JobId::from(id)).await?)?,
        Commands::Wait { id, poll } => follow(client, JobId::from(id), &poll).await?,
        Commands::Cancel { id } => print_json(&client.cancel(&JobId::from(id)).await?)?,
        Commands::List { limit } => print_json(&client.list(limit).await?)?,
    }
    Ok(())
}

/// Poll `id` until it finishes, printing progress to stderr.
///
/// Ctrl-C stops polling but leaves the job running on the server.
async fn follow(client: HttpJobClient, id: JobId, poll: &PollArgs) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let poller = StatusPoller::new(client, poll.to_config())
        .with_cancellation(token.clone())
        .on_progress(|record| {
            eprintln!(
                "[{}] {:>3}% {}",
                record.status,
                record.progress,
                record.current_step.as_deref().unwrap_or("")
            );
        });

    let stop = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    let record = poller
        .wait(&id)
        .await
        .with_context(|| format!("waiting for job {id}"))?;
    token.cancel();
    print_json(&record)?;

    if record.status != JobStatus::Completed {
        anyhow::bail!("job {id} ended as {}", record.status);
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
