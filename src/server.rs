//! Server runtime: wires the store, catalog, mailer, worker and router
//! together and runs until shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalog::CardCatalog;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::event::{
    create_event_channel, ServiceEvent, ServiceEventsChannel, ServiceEventsSender,
};
use crate::http::{build_router, AppState};
use crate::notify::{create_fulfillment_queue, FulfillmentWorker, HttpMailer, Notifier};
use crate::service::VerificationService;
use crate::store::{OrderStore, SqliteOrderStore};

/// Builder for constructing the cardvault server.
pub struct ServerBuilder {
    config: ServiceConfig,
}

impl ServerBuilder {
    /// Create a new server builder with the given configuration.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    /// Build the server: open the store, load the catalog, wire the
    /// fulfillment pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the configuration
    /// is invalid.
    pub async fn build(self) -> Result<RunningServer> {
        debug!("building cardvault with config: {:?}", self.config);

        if let Some(parent) = self.config.store.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store: Arc<dyn OrderStore> = Arc::new(
            SqliteOrderStore::open(&self.config.store.path, self.config.store.op_timeout())
                .await?,
        );

        let catalog = CardCatalog::new(self.config.catalog.cards.clone())?;
        if catalog.is_empty() {
            warn!("catalog is empty - no cards can be ordered");
        } else {
            info!("catalog loaded with {} cards", catalog.len());
        }

        let mailer: Arc<dyn Notifier> = Arc::new(HttpMailer::new(self.config.mailer.clone())?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();
        let (fulfill_tx, fulfill_rx) = create_fulfillment_queue();

        let worker = FulfillmentWorker::new(
            fulfill_rx,
            mailer,
            Arc::clone(&store),
            events_tx.clone(),
            self.config.mailer.max_attempts,
            self.config.mailer.retry_backoff(),
        );

        let service = Arc::new(VerificationService::new(
            catalog,
            store,
            self.config.payment.clone(),
            fulfill_tx,
            events_tx.clone(),
        ));

        Ok(RunningServer {
            config: self.config,
            service,
            worker: Some(worker),
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A built cardvault server, ready to run.
pub struct RunningServer {
    config: ServiceConfig,
    service: Arc<VerificationService>,
    worker: Option<FulfillmentWorker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: ServiceEventsSender,
    events_rx: Option<ServiceEventsChannel>,
}

impl RunningServer {
    /// The verification service, for embedding or tests.
    #[must_use]
    pub fn service(&self) -> Arc<VerificationService> {
        Arc::clone(&self.service)
    }

    /// Take the initial event receiver.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<ServiceEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to service events.
    #[must_use]
    pub fn subscribe_events(&self) -> ServiceEventsChannel {
        self.events_tx.subscribe()
    }

    /// Request the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the server until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(&mut self) -> Result<()> {
        info!("starting cardvault");
        let _ = self.events_tx.send(ServiceEvent::Started);

        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }

        // Event log sink; keeps the channel drained even with no other
        // subscribers.
        if let Some(mut events) = self.events_rx.take() {
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => debug!("service event: {event:?}"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    }
                }
            });
        }

        let state = AppState {
            service: Arc::clone(&self.service),
        };
        let router = build_router(state);

        let listener = TcpListener::bind(self.config.bind).await?;
        info!("listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown = async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("shutdown signal received");
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C received, initiating shutdown");
                        break;
                    }
                }
            }
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        let _ = self.events_tx.send(ServiceEvent::ShuttingDown);
        info!("server shutdown complete");
        Ok(())
    }
}
