//! Multi-client coordinator
//!
//! Runs one transport connection per client account, each on its own task,
//! and routes every inbound message to the shared [`NegotiationManager`].
//! One client's disconnects and backoffs never block the others. Shutdown
//! stops intake, waits for in-flight verifications up to a timeout, then
//! force-fails whatever is still mid-verification.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use quidpro_types::ClientProfile;

use crate::manager::NegotiationManager;
use crate::transport::ChatTransport;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long shutdown waits for in-flight verifications
    pub drain_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Cadence of deferred-outbox retries
    pub outbox_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            outbox_interval: Duration::from_secs(5),
        }
    }
}

/// Runs N client accounts concurrently against one manager.
pub struct MultiClientCoordinator {
    manager: Arc<NegotiationManager>,
    transport: Arc<dyn ChatTransport>,
    profiles: Vec<ClientProfile>,
    config: CoordinatorConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiClientCoordinator {
    pub fn new(
        manager: Arc<NegotiationManager>,
        transport: Arc<dyn ChatTransport>,
        profiles: Vec<ClientProfile>,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            transport,
            profiles,
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<NegotiationManager> {
        &self.manager
    }

    /// Spawn one task per client plus the outbox drain task.
    pub async fn connect_all(&self) {
        let mut tasks = self.tasks.lock().await;

        for profile in &self.profiles {
            self.manager.register_client(profile.clone());
            tasks.push(tokio::spawn(client_task(
                profile.clone(),
                self.transport.clone(),
                self.manager.clone(),
                self.shutdown_tx.subscribe(),
                self.config.clone(),
            )));
        }

        tasks.push(tokio::spawn(outbox_task(
            self.manager.clone(),
            self.shutdown_tx.subscribe(),
            self.config.outbox_interval,
        )));

        tracing::info!(clients = self.profiles.len(), "coordinator connected");
    }

    /// Stop intake, drain in-flight verifications, force-fail stragglers,
    /// and wind the tasks down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + self.config.drain_timeout;
        while self.manager.verifying_in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.manager.verifying_in_flight() > 0 {
            tracing::warn!(
                in_flight = self.manager.verifying_in_flight(),
                "drain timeout expired with verifications still in flight"
            );
        }
        self.manager.force_fail_pending().await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.drain_timeout, task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
        tracing::info!("coordinator shut down");
    }
}

/// One client's connection loop: connect, pump messages, reconnect with
/// capped exponential backoff. Faults stay inside this task.
async fn client_task(
    profile: ClientProfile,
    transport: Arc<dyn ChatTransport>,
    manager: Arc<NegotiationManager>,
    mut shutdown: watch::Receiver<bool>,
    config: CoordinatorConfig,
) {
    let mut delay = config.reconnect_base_delay;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match transport.connect(&profile).await {
            Ok(mut rx) => {
                tracing::info!(client = %profile.id, handle = %profile.handle, "client connected");
                delay = config.reconnect_base_delay;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        maybe = rx.recv() => match maybe {
                            Some(message) => manager.handle_message(message).await,
                            None => {
                                tracing::warn!(client = %profile.id, "connection closed");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(client = %profile.id, error = %err, "connect failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

/// Periodic retry of throttled/deferred actions.
async fn outbox_task(
    manager: Arc<NegotiationManager>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(interval) => {
                manager.drain_outbox().await;
            }
        }
    }
}
