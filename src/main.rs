mod logger;
mod surface;

use data::{ChartFeed, Command, EngineConfig, config};
use exchange::{Ticker, Timeframe, adapter::binance::Binance};
use surface::HeadlessSurface;
use tokio::sync::mpsc;

use std::time::Duration;

const SYMBOL_ENV: &str = "CHARTFILL_SYMBOL";
const INTERVAL_ENV: &str = "CHARTFILL_INTERVAL";

const DEFAULT_SYMBOL: &str = "BTC/USDT";
const DEFAULT_INTERVAL: Timeframe = Timeframe::M15;

const VISIBLE_BARS: f64 = 150.0;
const PAN_STEP_BARS: f64 = 40.0;
const PAN_PERIOD: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    logger::setup(cfg!(debug_assertions)).expect("Failed to initialize logger");

    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map_or_else(
            || "unknown location".to_string(),
            |loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        );
        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::error!("PANIC at {location}: {msg}");
        eprintln!("PANIC at {location}: {msg}");
    }));

    let config_path = config::config_path();
    let config = EngineConfig::load_or_default(&config_path);
    log::info!("Loaded engine config from {}", config_path.display());

    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => log::info!("Wrote default config to {}", config_path.display()),
            Err(err) => log::warn!("Failed to write config to {}: {err}", config_path.display()),
        }
    }

    let (ticker, timeframe) = match selected_view() {
        Ok(view) => view,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(2);
        }
    };

    let binance = Binance::new(config.live_reconnect_delay());
    let surface = HeadlessSurface::default();
    let mut feed = ChartFeed::new(binance.clone(), binance, surface.clone(), config);

    let (commands, rx) = mpsc::channel(64);

    if commands
        .send(Command::SwitchSession { ticker, timeframe })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(surface::simulate_panning(
        surface,
        commands.clone(),
        VISIBLE_BARS,
        PAN_STEP_BARS,
        PAN_PERIOD,
    ));

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for ctrl-c: {err}");
            return;
        }
        let _ = commands.send(Command::Shutdown).await;
    });

    feed.run(rx).await;

    if let (Some(ctx), Some(scheduler)) = (feed.context(), feed.scheduler()) {
        log::info!(
            "[{}] finished with {} bars, {} placeholders, {} gaps, backfill {:?}",
            ctx.session,
            ctx.store.bar_count(),
            ctx.store.placeholder_count(),
            ctx.store.missing_bars().len(),
            scheduler.state()
        );
    }
}

fn selected_view() -> Result<(Ticker, Timeframe), String> {
    let symbol = std::env::var(SYMBOL_ENV).unwrap_or_else(|_| DEFAULT_SYMBOL.to_string());
    let ticker = Ticker::new(&symbol).map_err(|e| e.to_string())?;

    let timeframe = match std::env::var(INTERVAL_ENV) {
        Ok(raw) => raw.parse::<Timeframe>().map_err(|e| e.to_string())?,
        Err(_) => DEFAULT_INTERVAL,
    };

    Ok((ticker, timeframe))
}
