//! Process-wide tracing subscriber built from the `[logging]` section.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::edgeproxy::config::LoggingConfig;

/// Targets that log every frame or handshake at debug. Capped unless tracing everything.
const NOISY_TARGETS: [&str; 5] = ["tokio_yamux", "tungstenite", "tokio_tungstenite", "hyper", "rustls"];

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Text,
}

impl Format {
    fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("text") {
            Format::Text
        } else {
            Format::Json
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl Output {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => Output::Stderr,
            "stdout" => Output::Stdout,
            "discard" => Output::Discard,
            path => Output::File(PathBuf::from(path)),
        }
    }

    fn writer(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        match self {
            Output::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
            Output::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
            Output::Discard => Ok(tracing_appender::non_blocking(io::sink())),
            Output::File(p) => Ok(tracing_appender::non_blocking(open_log_file(p)?)),
        }
    }
}

fn open_log_file(p: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("logging: mkdir {}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(p)
        .with_context(|| format!("logging: open {}", p.display()))
}

/// Filter used when `RUST_LOG` is unset.
fn default_directives(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "warn" | "error") => l.to_string(),
        _ => "info".to_string(),
    };
    if level == "trace" {
        return level;
    }
    let cap = if level == "error" { "error" } else { "warn" };
    let mut out = level;
    for target in NOISY_TARGETS {
        out.push_str(&format!(",{target}={cap}"));
    }
    out
}

pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format = Format::parse(&logging.format);
    let output = Output::parse(&logging.output);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = output.writer()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == Format::Text && output == Output::Stderr)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let layer = match format {
        Format::Json => layer.json().boxed(),
        Format::Text => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    tracing::debug!(
        format = ?format,
        to_file = matches!(output, Output::File(_)),
        "logging: initialized"
    );
    Ok(LoggingRuntime { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_caps_transport_internals() {
        let d = default_directives(" DEBUG ");
        assert!(d.starts_with("debug,"));
        assert!(d.contains("tokio_yamux=warn"));
        assert!(d.contains("tungstenite=warn"));

        assert_eq!(default_directives("trace"), "trace");
        assert!(default_directives("error").contains("hyper=error"));
        assert!(default_directives("verbose").starts_with("info,"));
        assert!(EnvFilter::try_new(default_directives("")).is_ok());
    }

    #[test]
    fn output_and_format_parse() {
        assert_eq!(Output::parse(""), Output::Stderr);
        assert_eq!(Output::parse(" stdout "), Output::Stdout);
        assert_eq!(Output::parse("discard"), Output::Discard);
        assert_eq!(
            Output::parse("logs/edgeproxy.log"),
            Output::File(PathBuf::from("logs/edgeproxy.log"))
        );
        assert_eq!(Format::parse("TEXT"), Format::Text);
        assert_eq!(Format::parse("json"), Format::Json);
        assert_eq!(Format::parse("logfmt"), Format::Json);
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = std::env::temp_dir().join(format!("edgeproxy_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("edgeproxy.log");
        let _ = std::fs::remove_dir_all(&dir);

        let (_writer, _guard) = Output::File(path.clone()).writer().unwrap();
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
