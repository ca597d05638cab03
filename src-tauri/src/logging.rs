use crate::config::{get_config, LoggingLevelsConfig, RedactionConfig};
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

type Patterns = Vec<(Regex, String)>;

struct RedactingWriter<W> {
    inner: W,
    patterns: Patterns,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let redacted = redact(&String::from_utf8_lossy(buf), &self.patterns);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Patterns,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

fn redact(line: &str, patterns: &Patterns) -> String {
    let mut out = line.to_string();
    for (re, replacement) in patterns {
        out = re.replace_all(&out, replacement.as_str()).into_owned();
    }
    out
}

/// The most verbose level enabled in config.
fn level_filter(levels: &LoggingLevelsConfig) -> &'static str {
    if levels.debug {
        "debug"
    } else if levels.info {
        "info"
    } else if levels.warning {
        "warn"
    } else if levels.error || levels.critical {
        "error"
    } else {
        "off"
    }
}

/// Invalid regexes are skipped rather than failing startup.
fn compile_patterns(redaction: &RedactionConfig) -> Patterns {
    if !redaction.enabled {
        return Vec::new();
    }
    redaction
        .patterns
        .iter()
        .filter_map(|p| match Regex::new(&p.regex) {
            Ok(re) => Some((re, p.placeholder.clone())),
            Err(e) => {
                eprintln!("ignoring redaction pattern {}: {}", p.name, e);
                None
            }
        })
        .collect()
}

pub fn init_logging() {
    let config = get_config();
    let logging = &config.logging;

    // RUST_LOG wins over the configured levels.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(&logging.levels)));

    let show_file = logging.format.location.show_file;
    let show_line = logging.format.location.show_line;
    let make_writer = RedactingMakeWriter {
        patterns: compile_patterns(&logging.redaction),
    };

    // Use Layer::boxed() to unify the types of the if/else branches
    let fmt_layer = if !logging.format.show_time {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(logging.verbose)
            .with_file(show_file)
            .with_line_number(show_line)
            .without_time()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(logging.verbose)
            .with_file(show_file)
            .with_line_number(show_line)
            .boxed()
    };

    // A second init (tests, re-entry) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedactionPattern;

    fn levels(debug: bool, info: bool, warning: bool, error: bool) -> LoggingLevelsConfig {
        LoggingLevelsConfig {
            debug,
            info,
            warning,
            error,
            critical: error,
        }
    }

    #[test]
    fn test_level_filter_picks_most_verbose() {
        assert_eq!(level_filter(&levels(true, true, true, true)), "debug");
        assert_eq!(level_filter(&levels(false, true, true, true)), "info");
        assert_eq!(level_filter(&levels(false, false, true, true)), "warn");
        assert_eq!(level_filter(&levels(false, false, false, true)), "error");
        assert_eq!(level_filter(&levels(false, false, false, false)), "off");
    }

    #[test]
    fn test_redacts_home_directory() {
        let redaction = RedactionConfig {
            enabled: true,
            patterns: vec![RedactionPattern {
                name: "home_dir".into(),
                regex: r"/(home|Users)/[^/\s]+".into(),
                placeholder: "/$1/<user>".into(),
            }],
        };
        let patterns = compile_patterns(&redaction);
        assert_eq!(
            redact("archive at /home/alice/muban/app.asar", &patterns),
            "archive at /home/<user>/muban/app.asar"
        );
    }

    #[test]
    fn test_disabled_or_invalid_patterns() {
        let mut redaction = RedactionConfig {
            enabled: false,
            patterns: vec![RedactionPattern {
                name: "any".into(),
                regex: ".*".into(),
                placeholder: "x".into(),
            }],
        };
        assert!(compile_patterns(&redaction).is_empty());

        redaction.enabled = true;
        redaction.patterns[0].regex = "(".into();
        assert!(compile_patterns(&redaction).is_empty());
    }

    #[test]
    fn test_writer_reports_full_length() {
        use std::io::Write;
        let patterns = vec![(Regex::new("secret").unwrap(), "***".to_string())];
        let mut w = RedactingWriter {
            inner: Vec::new(),
            patterns,
        };
        let n = w.write(b"a secret value").unwrap();
        assert_eq!(n, 14);
        assert_eq!(String::from_utf8(w.inner).unwrap(), "a *** value");
    }
}
