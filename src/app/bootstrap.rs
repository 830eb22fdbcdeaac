use std::path::Path;
use std::time::Duration;

use futures::future::join_all;
use log::{info, warn};
use tokio::time::{interval, MissedTickBehavior};

use crate::app::cli::{Cli, Commands};
use crate::config::{load_bundled, load_config, SchedulerConfig, BUNDLED_CONFIG_PATH};
use crate::error::{AppError, Result, SchedulerError};
use crate::fetch::{prepare_url, redact_url, Payload};
use crate::scheduler::{RequestKind, RequestState, Scheduler, SubmitOptions};

type Outcome = std::result::Result<Payload, SchedulerError>;

/// Entry point used by `main` once the command line is parsed.
pub async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            kind,
            symbols,
            deadline_secs,
            poll_secs,
        } => {
            let options = SubmitOptions {
                deadline: deadline_secs.map(Duration::from_secs),
            };
            let poll_every = Duration::from_secs(poll_secs.max(1));
            fetch(config, kind, &symbols, options, poll_every).await
        }
        Commands::Config => {
            print_config(&config);
            Ok(())
        }
    }
}

/// An explicit path wins; otherwise the bundled file under the working
/// directory, falling back to the built-in defaults when it is absent.
pub fn resolve_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    if let Some(path) = path {
        return load_config(path);
    }

    let root = std::env::current_dir()?;
    if root.join(BUNDLED_CONFIG_PATH).exists() {
        load_bundled(&root)
    } else {
        info!(
            "no {} under {}, using built-in defaults",
            BUNDLED_CONFIG_PATH,
            root.display()
        );
        Ok(SchedulerConfig::builtin())
    }
}

async fn fetch(
    config: SchedulerConfig,
    kind: RequestKind,
    symbols: &[String],
    options: SubmitOptions,
    poll_every: Duration,
) -> Result<()> {
    let scheduler = Scheduler::with_http(config)?;
    let outcomes = fetch_all(&scheduler, kind, symbols, options, poll_every).await?;

    let mut failed = 0;
    for (symbol, outcome) in &outcomes {
        match outcome {
            Ok(payload) => println!("{symbol}:\n{}", serde_json::to_string_pretty(payload)?),
            Err(err) => {
                failed += 1;
                let hint = if err.is_retryable() {
                    " (try again later)"
                } else {
                    ""
                };
                println!("{symbol}: {err}{hint}");
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
    scheduler.shutdown();

    if failed > 0 {
        warn!("{failed} of {} {kind} requests failed", outcomes.len());
    }
    Ok(())
}

/// Submit one request per symbol and wait for all of them, printing queue
/// progress every `poll_every`.
async fn fetch_all(
    scheduler: &Scheduler,
    kind: RequestKind,
    symbols: &[String],
    options: SubmitOptions,
    poll_every: Duration,
) -> Result<Vec<(String, Outcome)>> {
    let template = scheduler
        .config()
        .upstream
        .endpoint(kind)
        .ok_or_else(|| AppError::message(format!("no endpoint configured for {kind}")))?
        .to_string();

    let mut pending = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let url = prepare_url(&template, symbol)?;
        pending.push(scheduler.submit_with(url, symbol.as_str(), kind, options));
    }

    let all = join_all(pending);
    tokio::pin!(all);

    let mut ticker = interval(poll_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let outcomes = loop {
        tokio::select! {
            outcomes = &mut all => break outcomes,
            _ = ticker.tick() => report_progress(scheduler, kind, symbols),
        }
    };

    Ok(symbols.iter().cloned().zip(outcomes).collect())
}

fn report_progress(scheduler: &Scheduler, kind: RequestKind, symbols: &[String]) {
    for symbol in symbols {
        let status = scheduler.status_for(symbol, kind);
        match status.state {
            RequestState::Queued => println!(
                "{symbol}: queued at position {} (about {}s)",
                status.position, status.estimated_wait_seconds
            ),
            RequestState::InFlight => println!("{symbol}: fetching"),
            RequestState::RetryScheduled => println!("{symbol}: retry scheduled"),
            _ => {}
        }
    }
}

fn print_config(config: &SchedulerConfig) {
    println!(
        "budget:            {} calls per {}s",
        config.max_calls_per_window,
        config.window_length.as_secs()
    );
    println!(
        "retries:           {} (base delay {}ms)",
        config.max_retries,
        config.retry_base_delay.as_millis()
    );
    println!("watchdog:          every {}s", config.watchdog_interval.as_secs());
    println!(
        "upstream timeout:  {}s",
        config.upstream.request_timeout.as_secs()
    );
    for kind in RequestKind::ALL {
        let endpoint = config
            .upstream
            .endpoint(kind)
            .map(redact_url)
            .unwrap_or("(none)");
        println!(
            "{:<10} priority {:<3} {}",
            kind.as_str(),
            config.priorities.priority_of(kind),
            endpoint
        );
    }
}
