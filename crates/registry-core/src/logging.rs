//! Dual-sink logging: a concise terminal stream plus a timestamped debug
//! log file under `logs/`.

use simplelog::ColorChoice;
use simplelog::CombinedLogger;
use simplelog::ConfigBuilder;
use simplelog::LevelFilter;
use simplelog::TermLogger;
use simplelog::TerminalMode;
use simplelog::WriteLogger;

/// Initialize the process-wide logger. Terminal output is kept at `Info` and
/// above; a per-run file under `logs/` captures `Debug` and above. Call once,
/// at process start.
pub fn init(level: &str) {
    let level = parse_level(level);

    std::fs::create_dir_all("logs").ok();
    let timestamp = crate::identifier::now_millis();
    let log_path = format!("logs/{timestamp}.log");

    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();

    let term = TermLogger::new(
        level.min(LevelFilter::Info),
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    match std::fs::File::create(&log_path) {
        Ok(file) => {
            let write = WriteLogger::new(LevelFilter::Debug, config, file);
            if CombinedLogger::init(vec![term, write]).is_err() {
                log::warn!("logger already initialized");
            }
        }
        Err(e) => {
            if CombinedLogger::init(vec![term]).is_err() {
                log::warn!("logger already initialized");
            }
            log::warn!("could not open log file {log_path}: {e}");
        }
    }
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
