//! Logging setup for the lumen binaries.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everything else in
//! the crate does `use crate::tracing::prelude::*` for the level macros.

use std::fmt;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Our own targets are printed without this prefix.
const CRATE_PREFIX: &str = "lumen_controller::";

/// Whether stderr is the stream systemd set up for this service.
///
/// `JOURNAL_STREAM` holds `device:inode` of the journal socket; it is
/// inherited by children, so it only counts if stderr still points there.
fn stderr_is_journal_stream(journal_stream: Option<String>) -> bool {
    let Some(value) = journal_stream else {
        return false;
    };
    let Some((dev, ino)) = parse_journal_stream(&value) else {
        return false;
    };

    match rustix::fs::fstat(std::io::stderr()) {
        Ok(stat) => stat.st_dev as u64 == dev && stat.st_ino as u64 == ino,
        Err(_) => false,
    }
}

fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

/// Log to journald when running as a systemd service, else to stdout.
pub fn init_journald_or_stdout() {
    if stderr_is_journal_stream(std::env::var("JOURNAL_STREAM").ok()) {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer)
                    .init();
                return;
            }
            Err(e) => eprintln!("journald unavailable ({}), logging to stdout", e),
        }
    }

    init_stdout();
}

/// `RUST_LOG` filtering with INFO as the default level.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn init_stdout() {
    let formatter = LineFormatter {
        color: std::io::stdout().is_terminal(),
    };
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().event_format(formatter))
        .init();
    trace!("Logging to stdout");
}

/// One event per line: `HH:MM:SS LEVEL target: message key=value ...`
struct LineFormatter {
    color: bool,
}

#[derive(Default)]
struct Fields {
    message: String,
    pairs: Vec<(&'static str, String)>,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.pairs.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.pairs.push((field.name(), format!("{:?}", value)));
        }
    }
}

impl LineFormatter {
    fn level_style(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        write_local_time(&mut writer)?;

        let (color, label) = Self::level_style(*event.metadata().level());
        if self.color {
            write!(writer, " {}{}\x1b[0m ", color, label)?;
        } else {
            write!(writer, " {} ", label)?;
        }

        let target = event.metadata().target();
        write!(
            writer,
            "{}: {}",
            target.strip_prefix(CRATE_PREFIX).unwrap_or(target),
            fields.message
        )?;

        for (key, value) in &fields.pairs {
            if key.starts_with("log.") {
                continue;
            }
            if self.color {
                write!(writer, " \x1b[90m{}={}\x1b[0m", key, value)?;
            } else {
                write!(writer, " {}={}", key, value)?;
            }
        }

        writeln!(writer)
    }
}

// Local wall-clock time to the second; falls back to UTC when the offset
// cannot be determined (multi-threaded processes on some platforms).
fn write_local_time(w: &mut Writer<'_>) -> fmt::Result {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let formatted = now
        .format(time::macros::format_description!("[hour]:[minute]:[second]"))
        .map_err(|_| fmt::Error)?;
    write!(w, "{}", formatted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_journal_stream_pairs() {
        assert_eq!(parse_journal_stream("8:12345"), Some((8, 12345)));
        assert_eq!(parse_journal_stream("8"), None);
        assert_eq!(parse_journal_stream("x:1"), None);
        assert_eq!(parse_journal_stream("1:2:3"), None);
    }

    #[test]
    fn unset_journal_stream_means_stdout() {
        assert!(!stderr_is_journal_stream(None));
        assert!(!stderr_is_journal_stream(Some("garbage".into())));
    }
}
