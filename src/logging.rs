//! Logging setup: console layers split by severity plus a rotated debug file.
//!
//! Every sink goes through [`Redacting`] so configured secrets never reach a
//! terminal or a log file.

use std::borrow::Cow;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const CRATE_TARGET: &str = "cloud_pipeline";
const MASK: &str = "***";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level shown on stdout. Errors always go to stderr.
    pub console_level: Level,
    /// Directory for the debug log file. None disables the file sink.
    pub log_dir: Option<PathBuf>,
    /// File name prefix inside `log_dir`
    pub file_name: String,
    /// Values replaced with `***` in every sink
    pub secrets: Vec<String>,
}

/// Keeps the non-blocking file writer alive; drop it last.
#[allow(dead_code)]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(config: LoggingConfig) -> LogGuard {
    let secrets: Arc<[String]> = config
        .secrets
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let console_level = config.console_level;

    let mut layers = Vec::new();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(Redacting::new(io::stdout, secrets.clone()))
        .with_filter(filter_fn(move |meta| {
            meta.target().starts_with(CRATE_TARGET)
                && *meta.level() != Level::ERROR
                && *meta.level() <= console_level
        }))
        .boxed();
    layers.push(stdout_layer);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(Redacting::new(io::stderr, secrets.clone()))
        .with_filter(LevelFilter::ERROR)
        .boxed();
    layers.push(stderr_layer);

    let mut file_guard = None;
    if let Some(log_dir) = config.log_dir {
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, config.file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);

                let filter = EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(format!("{CRATE_TARGET}=debug")));
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(Redacting::new(non_blocking, secrets))
                    .with_filter(filter)
                    .boxed();
                layers.push(file_layer);
            }
            Err(e) => eprintln!("Failed to create log directory {}: {e}", log_dir.display()),
        }
    }

    // try_init so tests and repeated setup do not panic
    let _ = tracing_subscriber::registry().with(layers).try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Replace every occurrence of each secret with `***`.
pub fn redact<'a>(text: &'a str, secrets: &[String]) -> Cow<'a, str> {
    let mut out = Cow::Borrowed(text);
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        if out.contains(secret.as_str()) {
            out = Cow::Owned(out.replace(secret.as_str(), MASK));
        }
    }
    out
}

/// A `MakeWriter` that masks secrets in everything written through it.
#[derive(Clone)]
pub struct Redacting<M> {
    inner: M,
    secrets: Arc<[String]>,
}

impl<M> Redacting<M> {
    pub fn new(inner: M, secrets: Arc<[String]>) -> Self {
        Self { inner, secrets }
    }
}

impl<'a, M> MakeWriter<'a> for Redacting<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            secrets: self.secrets.clone(),
        }
    }
}

pub struct RedactingWriter<W> {
    inner: W,
    secrets: Arc<[String]>,
}

impl<W: Write> Write for RedactingWriter<W> {
    // The formatter hands over one whole event per call, so a secret is never split.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.secrets.is_empty() {
            self.inner.write_all(buf)?;
            return Ok(buf.len());
        }
        let text = String::from_utf8_lossy(buf);
        self.inner
            .write_all(redact(&text, &self.secrets).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn redact_masks_every_secret() {
        let secrets = vec!["tok-123".to_string(), String::new(), "pw".to_string()];
        assert_eq!(
            redact("Bearer tok-123 and pw, again tok-123", &secrets),
            "Bearer *** and ***, again ***"
        );
        assert!(matches!(redact("nothing here", &secrets), Cow::Borrowed(_)));
    }

    #[test]
    fn subscriber_output_is_redacted() {
        let capture = Capture::default();
        let secrets: Arc<[String]> = vec!["s3cr3t".to_string()].into();
        let subscriber = tracing_subscriber::fmt()
            .without_time()
            .with_writer(Redacting::new(capture.clone(), secrets))
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("token is s3cr3t");
        });
        let written = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("token is ***"), "{written}");
        assert!(!written.contains("s3cr3t"));
    }
}
