use anyhow::anyhow;
use fetcher::{get_config_info, setup_logger, Command, Engine, PromClient, RateLimiter};
use slog::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = get_config_info();
    let logger = setup_logger(&cli);
    let settings = cli.engine_settings()?;

    info!(logger, "Aire fetcher starting...");
    info!(logger, "  Backend URL: {}", cli.base_url());
    info!(logger, "  Window span: {}", settings.max_window_span);
    info!(logger, "  Scheduling: {:?}", settings.scheduling);

    let rate_limiter = Arc::new(RateLimiter::new(cli.token_capacity(), cli.refill_rate()));
    let client = PromClient::new(
        logger.clone(),
        &cli.base_url(),
        &cli.user_agent(),
        cli.request_timeout(),
        rate_limiter,
    )?;
    let engine = Engine::new(Arc::new(client), settings, logger.clone());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(signal_logger, "interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    let command = cli
        .command
        .clone()
        .ok_or_else(|| anyhow!("no command given, see --help"))?;

    let output = match command {
        Command::Range(args) => {
            let request = cli.range_request(&args);
            let acquisition = engine.acquire(&request, &cancel).await?;
            for failure in &acquisition.report.failures {
                warn!(logger, "window {} left out: {}", failure.window, failure.cause);
            }
            acquisition.to_json(args.round)?
        }
        Command::Latest(args) => {
            let request = cli.latest_request(&args);
            engine.latest(&request, &cancel).await?.to_json(args.round)?
        }
        Command::Stations(args) => {
            let stations = engine.stations(&args.station_filter()).await?;
            serde_json::to_string(&stations)?
        }
    };

    println!("{}", output);
    Ok(())
}
