//! Application wiring and lifecycle.
//!
//! [`BoxOffice`] builds every service against one storage backend, starts
//! the background work (seats-freed consumer, expiry sweeper) and stops it
//! again on shutdown.

use crate::booking::BookingOrchestrator;
use crate::config::{Config, StorageBackend};
use crate::coordinator::NotificationCoordinator;
use crate::handler::SeatsFreedHandler;
use crate::ledger::SeatLedger;
use crate::memory::{InMemoryBookingStore, InMemoryInventoryStore, InMemoryWaitlistStore};
use crate::sweeper::Sweeper;
use crate::waitlist::WaitlistQueue;
use boxoffice_core::environment::Clock;
use boxoffice_core::event::SEATS_FREED_TOPIC;
use boxoffice_core::event_bus::EventBus;
use boxoffice_core::notify::Notifier;
use boxoffice_core::store::{BookingStore, InventoryStore, WaitlistStore};
use boxoffice_postgres::{PgBookingStore, PgInventoryStore, PgWaitlistStore};
use boxoffice_runtime::{EventConsumer, InMemoryEventBus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Database connection failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The application was started twice
    #[error("Application already started")]
    AlreadyStarted,
}

/// The storage implementations every service runs on.
#[derive(Clone)]
pub struct Stores {
    /// Seat counters
    pub inventory: Arc<dyn InventoryStore>,
    /// Booking rows
    pub bookings: Arc<dyn BookingStore>,
    /// Waitlist entries
    pub waitlist: Arc<dyn WaitlistStore>,
}

impl Stores {
    /// Process-local stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inventory: Arc::new(InMemoryInventoryStore::new()),
            bookings: Arc::new(InMemoryBookingStore::new()),
            waitlist: Arc::new(InMemoryWaitlistStore::new()),
        }
    }

    /// `PostgreSQL` stores sharing one pool. Runs migrations first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the connection or a migration fails.
    pub async fn postgres(config: &Config) -> Result<Self, AppError> {
        tracing::info!(
            max_connections = config.storage.max_connections,
            "Connecting to PostgreSQL"
        );
        let pool = boxoffice_postgres::connect(
            &config.storage.database_url,
            config.storage.max_connections,
        )
        .await?;

        tracing::info!("Running database migrations...");
        boxoffice_postgres::migrate(&pool).await?;

        Ok(Self {
            inventory: Arc::new(PgInventoryStore::new(pool.clone())),
            bookings: Arc::new(PgBookingStore::new(pool.clone())),
            waitlist: Arc::new(PgWaitlistStore::new(pool)),
        })
    }
}

/// The assembled ticket inventory core.
pub struct BoxOffice {
    config: Config,
    ledger: SeatLedger,
    bookings: BookingOrchestrator,
    waitlist: WaitlistQueue,
    coordinator: NotificationCoordinator,
    sweeper: Sweeper,
    event_bus: Arc<dyn EventBus>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl BoxOffice {
    /// Build the application on the backend selected in `config`, with an
    /// in-process event bus.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the `PostgreSQL` backend cannot be reached.
    pub async fn from_config(
        config: Config,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppError> {
        tracing::info!(backend = ?config.storage.backend, "Initializing box office");
        let stores = match config.storage.backend {
            StorageBackend::Memory => Stores::in_memory(),
            StorageBackend::Postgres => Stores::postgres(&config).await?,
        };
        Ok(Self::new(
            config,
            stores,
            Arc::new(InMemoryEventBus::new()),
            clock,
            notifier,
        ))
    }

    /// Wire every service over `stores` and `event_bus`.
    #[must_use]
    pub fn new(
        config: Config,
        stores: Stores,
        event_bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = SeatLedger::new(stores.inventory, config.ledger_retry_policy());
        let waitlist = WaitlistQueue::new(
            stores.waitlist.clone(),
            ledger.clone(),
            clock.clone(),
            config.waitlist.max_length,
        );
        let coordinator = NotificationCoordinator::new(
            stores.waitlist.clone(),
            ledger.clone(),
            notifier,
            clock.clone(),
            config.booking_window(),
            config.waitlist.booking_url_base.clone(),
        );
        let bookings = BookingOrchestrator::new(
            stores.bookings,
            ledger.clone(),
            waitlist.clone(),
            coordinator.clone(),
            event_bus.clone(),
            clock.clone(),
        );
        let sweeper = Sweeper::new(stores.waitlist, coordinator.clone(), clock)
            .with_retry_policy(config.ledger_retry_policy());
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            ledger,
            bookings,
            waitlist,
            coordinator,
            sweeper,
            event_bus,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Spawn the seats-freed consumer and the expiry sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AlreadyStarted`] on a second call.
    pub fn start(&mut self) -> Result<(), AppError> {
        if !self.tasks.is_empty() {
            return Err(AppError::AlreadyStarted);
        }

        let handler = Arc::new(
            SeatsFreedHandler::new(self.coordinator.clone())
                .with_retry_policy(self.config.ledger_retry_policy()),
        );
        let consumer = EventConsumer::new(
            "seats-freed",
            vec![SEATS_FREED_TOPIC.to_string()],
            self.event_bus.clone(),
            handler,
            self.shutdown.subscribe(),
        )
        .with_retry_delay(Duration::from_secs(1));
        self.tasks.push(consumer.spawn());

        self.tasks.push(
            self.sweeper
                .clone()
                .spawn(self.config.sweep_interval(), self.shutdown.subscribe()),
        );

        tracing::info!(
            booking_window_secs = self.config.waitlist.booking_window_secs,
            max_waitlist = self.config.waitlist.max_length,
            sweep_interval_secs = self.config.sweeper.interval_secs,
            "Box office started"
        );
        Ok(())
    }

    /// Signal background tasks to stop and wait for them, up to the
    /// configured shutdown timeout.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down box office...");
        // No receivers means nothing was started.
        let _ = self.shutdown.send(());

        let timeout = self.config.shutdown_timeout();
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => tracing::error!(error = %e, "Background task panicked"),
                Err(_) => tracing::warn!(?timeout, "Background task did not stop in time"),
            }
        }
        tracing::info!("Box office stopped");
    }

    /// Seat ledger
    #[must_use]
    pub const fn ledger(&self) -> &SeatLedger {
        &self.ledger
    }

    /// Booking orchestrator
    #[must_use]
    pub const fn bookings(&self) -> &BookingOrchestrator {
        &self.bookings
    }

    /// Waitlist queue
    #[must_use]
    pub const fn waitlist(&self) -> &WaitlistQueue {
        &self.waitlist
    }

    /// Notification coordinator
    #[must_use]
    pub const fn coordinator(&self) -> &NotificationCoordinator {
        &self.coordinator
    }

    /// Expiry sweeper
    #[must_use]
    pub const fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Event bus carrying seats-freed events
    #[must_use]
    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.event_bus.clone()
    }

    /// Get the application configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}
