// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # corral control plane
//!
//! Facilities shared by the corral daemons: the placement daemon
//! (`corral-placerd`), the worker daemon (`corral-workerd`) and the
//! reconciliation daemons (`corral-dhcpd`, `corral-fwd`).  None of this is
//! specific to any one daemon:
//!
//! * [`backoff`]: retry policies for transient queue and KV conditions
//! * [`cmd`]: process exit handling for the daemon binaries
//! * [`shutdown`]: signal handling and the drain handshake used on shutdown
//! * [`stats`]: per-stage execution counters
//! * [`metrics`]: the optional HTTP endpoint that exposes those counters

pub mod backoff;
pub mod cmd;
pub mod metrics;
pub mod shutdown;
pub mod stats;

/// Default key prefix under which all cluster state is stored.
pub const DEFAULT_KEY_ROOT: &str = "/corral";

/// A type that allows adding file and line numbers to log messages
/// automatically. It should be instantiated at the root logger of each
/// executable that desires this functionality, as in the following example.
/// ```ignore
///     slog::Logger::root(drain, o!(FileKv))
/// ```
pub struct FileKv;

impl slog::KV for FileKv {
    fn serialize(
        &self,
        record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        // Only log file information when severity is at least info level
        if record.level() > slog::Level::Info {
            return Ok(());
        }
        serializer.emit_arguments(
            "file".into(),
            &format_args!("{}:{}", record.file(), record.line()),
        )
    }
}

/// Build the root logger for a daemon that logs to stderr at `level`.
pub fn stderr_logger(
    name: &str,
    level: dropshot::ConfigLoggingLevel,
) -> Result<slog::Logger, anyhow::Error> {
    use anyhow::Context;
    let log = dropshot::ConfigLogging::StderrTerminal { level }
        .to_logger(name)
        .context("failed to create logger")?;
    Ok(log.new(slog::o!(FileKv)))
}

/// Parse a log level given on the command line (e.g., "info", "debug").
pub fn parse_log_level(
    s: &str,
) -> Result<dropshot::ConfigLoggingLevel, anyhow::Error> {
    use anyhow::Context;
    serde_json::from_str(&format!("{:?}", s)).context("parsing log level")
}

#[cfg(test)]
mod test {
    use super::parse_log_level;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(
            parse_log_level("debug").unwrap(),
            dropshot::ConfigLoggingLevel::Debug
        ));
        assert!(matches!(
            parse_log_level("warn").unwrap(),
            dropshot::ConfigLoggingLevel::Warn
        ));
        assert!(parse_log_level("chatty").is_err());
    }
}
