use std::{fs, io};

const LOG_FILE: &str = "chartfill.log";

const QUIET_TARGETS: [&str; 5] = ["hyper", "hyper_util", "reqwest", "rustls", "tokio_rustls"];

pub fn setup(is_debug: bool) -> Result<(), fern::InitError> {
    let level = if is_debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let log_path = data::data_path(Some(LOG_FILE));
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level);

    for target in QUIET_TARGETS {
        dispatch = dispatch.level_for(target, log::LevelFilter::Warn);
    }

    dispatch
        .chain(io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}
