//! Standalone event bus server runtime.
//!
//! The server owns one backend, creates the well-known topics at startup
//! and keeps the bus running until SIGINT, SIGTERM or its shutdown token
//! fires. Shutdown stops the bus, which cancels and joins every consumer
//! task before releasing connections.

use crate::bus::EventBus;
use crate::error::EventBusResult;
use crate::factory::Backend;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Topics created by the server at startup unless overridden.
pub const WELL_KNOWN_TOPICS: [&str; 6] = [
    "plot_events",
    "character_events",
    "scene_events",
    "writing_events",
    "qa_events",
    "coherence_events",
];

/// Long-running owner of a single event bus.
#[derive(Debug)]
pub struct EventBusServer<B: EventBus = Backend> {
    bus: Arc<B>,
    topics: Vec<String>,
    shutdown: CancellationToken,
}

impl<B: EventBus> EventBusServer<B> {
    /// Server around `bus` creating [`WELL_KNOWN_TOPICS`].
    pub fn new(bus: B) -> Self {
        Self {
            bus: Arc::new(bus),
            topics: WELL_KNOWN_TOPICS.iter().map(|t| t.to_string()).collect(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the topics created at startup.
    pub fn with_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// The served bus, for in-process subscribers.
    pub fn bus(&self) -> Arc<B> {
        self.bus.clone()
    }

    /// Topics created at startup.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Token that stops a running server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the bus and create the configured topics.
    pub async fn start(&self) -> EventBusResult<()> {
        self.bus.start().await?;

        if let Err(e) = self.bus.create_topics(&self.topics).await {
            self.bus.stop().await;
            return Err(e);
        }

        info!(
            implementation = self.bus.name(),
            topics = ?self.topics,
            "Event bus server started"
        );
        Ok(())
    }

    /// Run until `signal` resolves or the shutdown token is cancelled, then
    /// stop the bus.
    pub async fn run_until<F>(&self, signal: F) -> EventBusResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        tokio::select! {
            () = signal => info!("Shutdown signal received"),
            () = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        self.bus.stop().await;
        info!(implementation = self.bus.name(), "Event bus server stopped");
        Ok(())
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run_until_signal(&self) -> EventBusResult<()> {
        self.run_until(termination_signal()).await
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, waiting for SIGINT only");
            return interrupt_signal().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        () = interrupt_signal() => {}
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    interrupt_signal().await
}

async fn interrupt_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await
        }
    }
}
