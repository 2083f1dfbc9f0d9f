//! Thin facade over `slog`. Components take a `Logger` (or build a `Discard`
//! root when none is supplied) and create children with `log.new(o!(...))`;
//! the daemon builds the root logger from a TOML configuration file.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a logger from a TOML logger configuration string.
pub fn from_toml_str(config: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).expect("Error parsing logger configuration");
    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a TOML logger configuration file.
pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logger configuration file");
    config.build_logger().expect("Error building logger")
}

/// Default terminal logger used when no configuration file is given.
pub fn terminal() -> Logger {
    from_toml_str(DEFAULT_CONFIG)
}

/// A logger that swallows everything.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger() {
        let log = discard();
        debug!(log, "dropped"; "key" => 1);
    }

    #[test]
    fn test_from_toml_str() {
        let log = from_toml_str(DEFAULT_CONFIG);
        trace!(log, "configured");
    }

    #[test]
    #[should_panic(expected = "Error parsing logger configuration")]
    fn test_from_toml_str_rejects_garbage() {
        let _ = from_toml_str("not even toml [");
    }
}
