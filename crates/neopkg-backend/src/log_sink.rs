use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Level at which a backend's output stream is re-emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    #[default]
    None,
}

impl LogLevel {
    /// Case-insensitive; blank or unrecognized input is `None`.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::None,
        }
    }

    fn emit(self, backend: &str, stream: &'static str, line: &str) {
        match self {
            Self::Trace => trace!(backend, stream, "{line}"),
            Self::Debug => debug!(backend, stream, "{line}"),
            Self::Info => info!(backend, stream, "{line}"),
            Self::Warn => warn!(backend, stream, "{line}"),
            Self::Error => error!(backend, stream, "{line}"),
            Self::None => {}
        }
    }
}

/// Drains `reader` line by line into `tracing`. The stream is always read to
/// the end so the child never blocks on a full pipe.
pub(crate) fn spawn_log_pump<R>(
    reader: R,
    backend: String,
    stream: &'static str,
    level: LogLevel,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\n');
        loop {
            match segments.next_segment().await {
                Ok(Some(segment)) => {
                    let line = String::from_utf8_lossy(&segment);
                    level.emit(&backend, stream, line.trim_end_matches('\r'));
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(backend = %backend, stream, error = %err, "backend output stream closed");
                    break;
                }
            }
        }
    })
}
