use std::sync::Arc;

use courier_common::{Record, internal, logging};
use courier_delivery::{DnsConfig, MxCache};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};

use crate::{
    config::Output,
    engine::{Engine, EngineError},
};

/// Records buffered per output. Records for an output whose buffer is full
/// are dropped.
pub const RECORD_BUFFER: usize = 64;

/// Severity given to records read from stdin (informational).
pub const STDIN_SEVERITY: i32 = 6;

/// Top-level configuration, and the process that runs it.
#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(alias = "output", default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub dns: DnsConfig,
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

/// Reads one record per line from `reader` and hands a copy to every
/// output still accepting. An output that has fallen [`RECORD_BUFFER`]
/// records behind misses the record; the others are never held up by it.
/// Returns when the reader is exhausted or every output has stopped.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn feed<R: AsyncBufRead + Unpin>(
    reader: R,
    mut outputs: Vec<(String, mpsc::Sender<Record>)>,
    hostname: &str,
) -> std::io::Result<()> {
    let mut lines = reader.lines();

    while !outputs.is_empty() {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let record = Record::new(line, STDIN_SEVERITY, "stdin", hostname);

        outputs.retain(|(name, sender)| match sender.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(output = %name, "Output is behind, dropping record");
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(output = %name, "Output stopped, no longer feeding it");
                false
            }
        });
    }

    Ok(())
}

async fn join(engines: &mut JoinSet<(String, Result<(), EngineError>)>) -> usize {
    let mut failed = 0;

    while let Some(joined) = engines.join_next().await {
        match joined {
            Ok((name, Ok(()))) => internal!("Output {} stopped", name),
            Ok((name, Err(e))) => {
                tracing::error!(output = %name, "Output stopped: {e}");
                failed += 1;
            }
            Err(e) => {
                tracing::error!("Output task failed: {e}");
                failed += 1;
            }
        }
    }

    failed
}

impl Courier {
    /// Starts one engine per output, all sharing one MX cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be built.
    pub fn spawn(
        self,
        engines: &mut JoinSet<(String, Result<(), EngineError>)>,
    ) -> anyhow::Result<Vec<(String, mpsc::Sender<Record>)>> {
        let cache = Arc::new(MxCache::new(&self.dns)?);
        self.spawn_with_cache(engines, &cache)
    }

    fn spawn_with_cache(
        self,
        engines: &mut JoinSet<(String, Result<(), EngineError>)>,
        cache: &Arc<MxCache>,
    ) -> anyhow::Result<Vec<(String, mpsc::Sender<Record>)>> {
        if self.outputs.is_empty() {
            anyhow::bail!("No outputs configured");
        }

        let mut senders = Vec::with_capacity(self.outputs.len());
        for output in self.outputs {
            let (sender, receiver) = mpsc::channel(RECORD_BUFFER);
            let engine = Engine::new(output.name.clone(), output.engine, Arc::clone(cache));
            senders.push((output.name.clone(), sender));

            engines.spawn(async move {
                let result = engine.run(receiver).await;
                (output.name, result)
            });
        }

        Ok(senders)
    }

    /// Runs every output until stdin closes, a signal arrives, or every
    /// output has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if no output is configured, the resolver cannot be
    /// built, or any output stopped with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let mut engines = JoinSet::new();
        let senders = self.spawn(&mut engines)?;

        let feeder = tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = feed(stdin, senders, &hostname).await {
                tracing::error!("Reading records from stdin failed: {e}");
            }
        });

        let failed = tokio::select! {
            failed = join(&mut engines) => failed,
            r = shutdown() => {
                r?;
                feeder.abort();
                join(&mut engines).await
            }
        };
        feeder.abort();

        internal!(level = INFO, "Shutting down...");

        if failed > 0 {
            anyhow::bail!("{failed} output(s) stopped with an error");
        }

        Ok(())
    }
}
