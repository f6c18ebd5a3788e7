//! One output's lifecycle: configure, probe, then forward records until the
//! source runs dry or a delivery fails.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{Record, internal};
use courier_delivery::{DeliveryError, DeliveryPlanner, MxCache, SmtpSession, Transport};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigError, EngineConfig};

/// Where an [`Engine`] is in its lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Probing,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("startup probe failed: {0}")]
    Probe(#[source] DeliveryError),

    #[error("delivery failed: {0}")]
    Delivery(#[source] DeliveryError),

    #[error("engine {0} has already been started")]
    AlreadyStarted(String),
}

/// Supplies records to an engine. `None` means no more records will come.
#[async_trait]
pub trait RecordSource: Send {
    async fn next(&mut self) -> Option<Record>;
}

#[async_trait]
impl RecordSource for mpsc::Receiver<Record> {
    async fn next(&mut self) -> Option<Record> {
        self.recv().await
    }
}

pub struct Engine {
    name: String,
    config: EngineConfig,
    cache: Arc<MxCache>,
    transport: Arc<dyn Transport>,
    state: watch::Sender<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// An engine speaking SMTP, resolving exchangers through `cache`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: EngineConfig, cache: Arc<MxCache>) -> Self {
        let transport = Arc::new(SmtpSession::new(
            config.helo_name.clone(),
            config.tls(),
            config.timeouts.clone(),
        ));
        Self::with_transport(name, config, cache, transport)
    }

    #[must_use]
    pub fn with_transport(
        name: impl Into<String>,
        config: EngineConfig,
        cache: Arc<MxCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            cache,
            transport,
            state: watch::Sender::new(EngineState::Uninitialized),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Observes state changes from another task.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn transition(&self, state: EngineState) {
        tracing::debug!(engine = %self.name, ?state, "Engine state change");
        self.state.send_replace(state);
    }

    /// Runs the engine to completion.
    ///
    /// The engine is stopped afterwards, whatever the outcome. An engine
    /// runs at most once.
    ///
    /// # Errors
    ///
    /// Returns the configuration problem, the failed probe or the first
    /// failed delivery. A source that runs dry is not an error. Running an
    /// engine that was already started returns
    /// [`EngineError::AlreadyStarted`] without touching `source`.
    #[tracing::instrument(skip_all, fields(engine = %self.name))]
    pub async fn run(&self, mut source: impl RecordSource) -> Result<(), EngineError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == EngineState::Uninitialized {
                *state = EngineState::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(EngineError::AlreadyStarted(self.name.clone()));
        }
        tracing::debug!(
            engine = %self.name,
            state = ?EngineState::Initializing,
            "Engine state change"
        );

        let result = self.drive(&mut source).await;
        self.transition(EngineState::Stopped);

        match &result {
            Ok(()) => internal!(level = INFO, "Engine {} finished", self.name),
            Err(e) => tracing::error!(engine = %self.name, "{e}"),
        }

        result
    }

    async fn drive(&self, source: &mut impl RecordSource) -> Result<(), EngineError> {
        let planner = DeliveryPlanner::new(
            self.config.relay_target()?,
            self.config.from.clone(),
            self.config.to.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.transport),
            self.config.timeouts.clone(),
        );

        self.transition(EngineState::Probing);
        planner.probe().await.map_err(EngineError::Probe)?;
        internal!(level = INFO, "Engine {} probe succeeded", self.name);

        self.transition(EngineState::Running);
        while let Some(record) = source.next().await {
            planner
                .deliver(&record.to_message_body())
                .await
                .map_err(EngineError::Delivery)?;
        }

        Ok(())
    }
}
