use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("HAPTIC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging for the binary from `HAPTIC_LOG`/`RUST_LOG`.
///
/// Only the first call installs the logger; every call returns the level in
/// effect.
pub fn init_rust_logging() -> LevelFilter {
    *RUST_LOG_LEVEL.get_or_init(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level.to_string().to_lowercase());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        level
    })
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, set_python_log_level, set_python_log_level_str};

#[cfg(feature = "python")]
mod python {
    use std::sync::Mutex;

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::{env_level, parse_level};

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to Python's `logging` module.
    struct PyLogger {
        level: Mutex<LevelFilter>,
    }

    fn python_level(level: log::Level) -> u32 {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn level(&self) -> LevelFilter {
            *self.level.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            let level = python_level(record.level());
            Python::attach(|py| {
                let result = py
                    .import("logging")
                    .and_then(|logging| logging.call_method1("getLogger", (target.as_str(),)))
                    .and_then(|logger| logger.call_method1("log", (level, message.as_str())));
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Installed on the first call.
    pub fn init_python_logging(_py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        PY_LOGGER.get_or_init(|| {
            let leaked: &'static PyLogger = Box::leak(Box::new(PyLogger {
                level: Mutex::new(level),
            }));
            if log::set_logger(leaked).is_ok() {
                log::set_max_level(level);
            }
            leaked
        });
        Ok(())
    }

    /// Change the minimum level forwarded to Python.
    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger.level.lock().unwrap_or_else(|e| e.into_inner()) = level;
        }
        log::set_max_level(level);
        Ok(())
    }

    /// Parse a level name (falling back to the environment) and apply it.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        set_python_log_level(py, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn init_is_repeatable() {
        let first = init_rust_logging();
        assert_eq!(init_rust_logging(), first);
    }
}
