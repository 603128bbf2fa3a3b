// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging utilities for Fennec.
//!
//! Everything in the crate logs through the `log` facade, usually via the
//! `*_fmt!` macros that prefix a context tag.  The backend is either
//! `env_logger` or, when `proxy.logging.structured` is set, an `slog` drain
//! that receives `log` records through `slog-stdlog`.

pub mod config;
pub mod structured;
mod wrapper;


use log::LevelFilter;
use once_cell::sync::OnceCell;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use self::config::LoggingConfig;
use self::structured::{LoggerGuard, init_global_logger};

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);
static STRUCTURED_GUARD: OnceCell<LoggerGuard> = OnceCell::new();

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        LevelFilter::Info => "info",
        LevelFilter::Warn => "warn",
        LevelFilter::Error => "error",
        LevelFilter::Off => "off",
    }
}

/// Initialize `env_logger` once.  `RUST_LOG` wins over `level`.
pub fn init(level: Option<LevelFilter>) {
    INIT.call_once(|| {
        let env = env_logger::Env::default()
            .filter_or("RUST_LOG", level.map_or("info", level_name));

        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .try_init();

        log::info!("Logging initialized at level: {}", log::max_level());
    });
}

/// Initialize logging from the `proxy.logging` section.
///
/// Falls back to [`init`] when structured output is disabled or the
/// `log` bridge cannot be installed.
pub fn init_with_config(level: LevelFilter, config: &LoggingConfig) {
    if !config.structured {
        init(Some(config.level_filter().unwrap_or(level)));
        return;
    }

    INIT.call_once(|| {
        let logger_config = config.to_logger_config();
        let bridge_level = config.level_filter().unwrap_or(level);

        let guard = init_global_logger(&logger_config);
        match slog_stdlog::init_with_level(bridge_level.to_level().unwrap_or(log::Level::Info)) {
            Ok(()) => {
                let _ = STRUCTURED_GUARD.set(guard);
                USING_STRUCTURED.store(true, Ordering::SeqCst);
                log::info!("Structured logging initialized ({:?})", logger_config.format);
            }
            Err(e) => {
                // Another logger already owns the facade; keep it.
                drop(guard);
                eprintln!("structured logging unavailable: {e}");
            }
        }
    });
}

/// Whether the slog backend is active.
pub fn is_structured_logging() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}
