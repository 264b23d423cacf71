//! Stdin/stdout JSON bridge for the host command channel.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages, dispatches them
//! through a [`HostSession`], and writes `ResponseEnvelope` and
//! `EventEnvelope` messages as newline-delimited JSON.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};

use super::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use super::handler::HostSession;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::memory::{FileMemoryStore, MemoryStore};

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Upper bound on draining events after the session stops.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the bridge over the process's stdin and stdout until stdin closes or
/// a `runtime.stop` command is received.
///
/// When memory is enabled, conversations are kept in a [`FileMemoryStore`]
/// under [`MemoryConfig::resolved_store_dir`](crate::config::MemoryConfig::resolved_store_dir).
pub async fn run_stdio_bridge(config: AgentConfig) -> Result<()> {
    let memory = config.memory.enabled.then(|| {
        let dir = config.memory.resolved_store_dir();
        tracing::info!(dir = %dir.display(), "using file memory store");
        Arc::new(FileMemoryStore::new(&dir)) as Arc<dyn MemoryStore>
    });
    run_bridge(
        config,
        memory,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Run the bridge over any line reader and writer.
///
/// Two tasks operate in parallel:
///
/// 1. **Reader** -- reads newline-delimited JSON, dispatches each
///    `CommandEnvelope` through the session, and writes the resulting
///    `ResponseEnvelope`.
/// 2. **Event forwarder** -- writes every `EventEnvelope` the session emits.
///
/// Both share one writer so lines never interleave. When the reader
/// finishes, the session is stopped and the forwarder drains whatever
/// events were emitted during shutdown.
pub async fn run_bridge<R, W>(
    config: AgentConfig,
    memory: Option<Arc<dyn MemoryStore>>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, events) = HostSession::start(config, memory, Handle::current()).await;
    let writer = Arc::new(Mutex::new(BufWriter::new(writer)));

    let event_handle = tokio::spawn(forward_events(events, Arc::clone(&writer)));

    let reader_result = run_reader(&session, reader, Arc::clone(&writer)).await;

    // Dropping the session releases the bridge, closing the event channel.
    session.stop().await;
    drop(session);
    let abort = event_handle.abort_handle();
    match tokio::time::timeout(EVENT_DRAIN_TIMEOUT, event_handle).await {
        Ok(Err(e)) => tracing::error!(error = %e, "event forwarder task failed"),
        Ok(Ok(())) => {}
        Err(_) => {
            tracing::warn!("event forwarder did not drain in time; aborting");
            abort.abort();
        }
    }

    reader_result
}

async fn forward_events<W>(mut events: mpsc::UnboundedReceiver<EventEnvelope>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                let mut w = writer.lock().await;
                if let Err(e) = write_line(&mut w, &json).await {
                    tracing::warn!(
                        error = %e,
                        "failed to write event envelope; stopping event forwarder"
                    );
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, event = %event.event, "failed to serialize event envelope; skipping");
            }
        }
    }
    tracing::info!("event channel closed; stopping event forwarder");
}

/// Read line-by-line, dispatch each command, and write responses.
async fn run_reader<R, W>(session: &HostSession, mut reader: R, writer: SharedWriter<W>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Channel(format!("failed to read command line: {e}")))?;

        if bytes_read == 0 {
            tracing::info!("input closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_line = %trimmed,
                    "failed to parse command envelope"
                );
                let error_response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(&writer, &error_response).await?;
                continue;
            }
        };

        let is_stop = envelope.command == CommandName::RuntimeStop;
        let response = session.handle(envelope).await;
        write_response(&writer, &response).await?;

        if is_stop {
            tracing::info!("runtime.stop received; shutting down bridge");
            break;
        }
    }

    Ok(())
}

async fn write_response<W>(writer: &SharedWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let json = serde_json::to_string(response).map_err(|e| {
        AgentError::Contract(format!("failed to serialize response envelope: {e}"))
    })?;
    let mut w = writer.lock().await;
    write_line(&mut w, &json).await
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| AgentError::Channel(format!("failed to write line: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| AgentError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AgentError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::host::contract::EVENT_VERSION;

    #[test]
    fn parse_error_response_is_well_formed() {
        let resp = ResponseEnvelope::error("parse-error", "bad json");
        assert!(!resp.ok);
        assert_eq!(resp.request_id, "parse-error");
        assert_eq!(resp.v, EVENT_VERSION);
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn bad_line_then_eof() {
        let input: &[u8] = b"not json\n\n";
        let (client, mut server) = tokio::io::duplex(4096);
        let config = AgentConfig {
            greeting: String::new(),
            ..AgentConfig::default()
        };
        run_bridge(config, None, BufReader::new(input), client)
            .await
            .unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        let lines: Vec<ResponseEnvelope> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].request_id, "parse-error");
        assert!(!lines[0].ok);
    }
}
