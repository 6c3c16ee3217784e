//! Liveness registration: publish this node under a lease and keep the lease
//! alive until told to stop or until liveness can no longer be maintained.

use std::sync::Arc;
use std::time::Duration;

use cache_sdk::coordination::{CoordinationError, CoordinationStore, LeaseId};
use cache_sdk::lease::KeepAlive;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to grant lease for {service}: {source}")]
    Grant {
        service: String,
        #[source]
        source: CoordinationError,
    },
    #[error("failed to publish {service} at {addr}: {source}")]
    Publish {
        service: String,
        addr: String,
        #[source]
        source: CoordinationError,
    },
    #[error("lease keep-alive for {service} closed; registration lost")]
    KeepAliveLost { service: String },
    #[error("registration of {service} stopped: {reason}")]
    Stopped { service: String, reason: String },
    #[error("registration task for {service} aborted: {reason}")]
    Aborted { service: String, reason: String },
}

/// Registers one address under one service name.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    service: String,
    addr: String,
    ttl: Duration,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        service: impl Into<String>,
        addr: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            service: service.into(),
            addr: addr.into(),
            ttl,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register and hold the registration until `stop` fires, the store
    /// session ends, or the lease can no longer be kept alive.
    ///
    /// A stop carrying a reason is returned as [`RegistrationError::Stopped`];
    /// a stop without one (or a dropped sender) ends cleanly. Both revoke the
    /// lease first. A closed session ends cleanly without revoking.
    pub async fn register(
        &self,
        mut stop: oneshot::Receiver<Option<String>>,
    ) -> Result<(), RegistrationError> {
        let session = self.store.session();
        let lease = self.store.grant(self.ttl).await.map_err(|source| {
            metrics::REGISTRATION_EVENTS
                .with_label_values(&["failed"])
                .inc();
            RegistrationError::Grant {
                service: self.service.clone(),
                source,
            }
        })?;

        if let Err(source) = self.store.publish(&self.service, &self.addr, lease.id).await {
            metrics::REGISTRATION_EVENTS
                .with_label_values(&["failed"])
                .inc();
            self.revoke(lease.id).await;
            return Err(RegistrationError::Publish {
                service: self.service.clone(),
                addr: self.addr.clone(),
                source,
            });
        }

        let mut keep_alive = KeepAlive::spawn(Arc::clone(&self.store), lease);
        metrics::REGISTRATION_EVENTS
            .with_label_values(&["registered"])
            .inc();
        info!(
            service = %self.service,
            addr = %self.addr,
            lease = lease.id,
            ttl_ms = lease.ttl.as_millis() as u64,
            "registered"
        );

        loop {
            tokio::select! {
                biased;
                reason = &mut stop => {
                    drop(keep_alive);
                    self.revoke(lease.id).await;
                    metrics::REGISTRATION_EVENTS
                        .with_label_values(&["stopped"])
                        .inc();
                    return match reason {
                        Ok(Some(reason)) => Err(RegistrationError::Stopped {
                            service: self.service.clone(),
                            reason,
                        }),
                        Ok(None) | Err(_) => {
                            info!(service = %self.service, "registration stopped");
                            Ok(())
                        }
                    };
                }
                _ = session.cancelled() => {
                    self.session_closed();
                    return Ok(());
                }
                ack = keep_alive.recv() => match ack {
                    Some(ack) => trace!(
                        service = %self.service,
                        lease = ack.lease,
                        ttl_ms = ack.ttl.as_millis() as u64,
                        "lease renewed"
                    ),
                    // Renewal also stops when the session ends.
                    None if session.is_cancelled() => {
                        self.session_closed();
                        return Ok(());
                    }
                    None => {
                        self.revoke(lease.id).await;
                        metrics::REGISTRATION_EVENTS
                            .with_label_values(&["keepalive_lost"])
                            .inc();
                        warn!(service = %self.service, lease = lease.id, "lease keep-alive closed");
                        return Err(RegistrationError::KeepAliveLost {
                            service: self.service.clone(),
                        });
                    }
                },
            }
        }
    }

    fn session_closed(&self) {
        metrics::REGISTRATION_EVENTS
            .with_label_values(&["session_closed"])
            .inc();
        info!(service = %self.service, "coordination session closed");
    }

    async fn revoke(&self, lease: LeaseId) {
        match self.store.revoke(lease).await {
            Ok(()) => debug!(service = %self.service, lease, "lease revoked"),
            Err(CoordinationError::LeaseNotFound(_)) => {
                debug!(service = %self.service, lease, "lease already gone")
            }
            Err(err) => warn!(service = %self.service, lease, error = %err, "failed to revoke lease"),
        }
    }
}

/// A running [`Registrar`], owned by whoever started it.
pub struct Registration {
    service: String,
    stop: Option<oneshot::Sender<Option<String>>>,
    task: JoinHandle<Result<(), RegistrationError>>,
}

impl Registration {
    pub fn spawn(registrar: Registrar) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let service = registrar.service().to_string();
        let task = tokio::spawn(async move { registrar.register(stop_rx).await });
        Self {
            service,
            stop: Some(stop),
            task,
        }
    }

    /// Ask the registration to end. A `reason` is reported back by [`join`](Self::join).
    pub fn stop(&mut self, reason: Option<String>) {
        if let Some(stop) = self.stop.take() {
            // The task may already have finished on its own.
            let _ = stop.send(reason);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<(), RegistrationError> {
        let Self { service, stop, task } = self;
        // Held until the task ends; dropping it early would read as a stop.
        let _stop = stop;
        match task.await {
            Ok(result) => result,
            Err(err) => Err(RegistrationError::Aborted {
                service,
                reason: err.to_string(),
            }),
        }
    }
}
