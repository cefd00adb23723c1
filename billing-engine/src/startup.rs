//! Application startup and lifecycle management.

use crate::config::{BillingConfig, SchedulerConfig};
use crate::engine::{InvoiceTransitions, RunExecutor, ScheduleTransitions};
use crate::handlers::{
    health_check, list_schedule_runs, metrics_handler, readiness_check, run_schedule_now,
    trigger_sweep,
};
use crate::services::{
    init_metrics, AuditSink, BillingStore, Database, DocumentRenderer, EmailSender,
    HttpDocumentRenderer, InvoiceMailer, SettingsCache, SettingsProvider,
    SmtpEmailSender, TracingAuditSink,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub settings: Arc<SettingsCache>,
    pub executor: RunExecutor,
    pub schedules: ScheduleTransitions,
    pub invoices: InvoiceTransitions,
}

impl AppState {
    /// Wire the engine services around a store and its collaborators.
    pub fn assemble(
        store: Arc<dyn BillingStore>,
        settings: Arc<SettingsCache>,
        mailer: InvoiceMailer,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let invoices =
            InvoiceTransitions::new(store.clone(), audit.clone(), settings.clone(), mailer);
        let schedules = ScheduleTransitions::new(store.clone(), audit.clone());
        let executor = RunExecutor::new(store.clone(), settings.clone(), invoices.clone(), audit);

        Self {
            store,
            settings,
            executor,
            schedules,
            invoices,
        }
    }
}

/// HTTP routes served by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/runs", post(trigger_sweep))
        .route("/schedules/:id/run", post(run_schedule_now))
        .route("/schedules/:id/runs", get(list_schedule_runs))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Sweep cadence: the `scheduler.interval_secs` setting when present, the
/// configured interval otherwise.
async fn sweep_interval(settings: &SettingsCache, default: Duration) -> Duration {
    match settings.sweep_interval().await {
        Ok(Some(interval)) if !interval.is_zero() => interval,
        Ok(_) => default,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read sweep interval, using configured value");
            default
        }
    }
}

/// Run a billing sweep on every tick until the task is dropped.
pub async fn run_sweep_loop(executor: RunExecutor, settings: Arc<SettingsCache>, default: Duration) {
    let mut period = sweep_interval(&settings, default).await;
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_secs = period.as_secs(), "Billing sweep loop started");

    loop {
        ticker.tick().await;

        let as_of = Utc::now().date_naive();
        match executor.execute_due_runs(as_of).await {
            Ok(summary) => tracing::info!(
                as_of = %as_of,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Scheduled sweep finished"
            ),
            Err(e) => tracing::error!(error = %e, as_of = %as_of, "Scheduled sweep failed"),
        }

        let next = sweep_interval(&settings, default).await;
        if next != period {
            tracing::info!(
                interval_secs = next.as_secs(),
                "Sweep interval changed"
            );
            period = next;
            ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    scheduler: SchedulerConfig,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let settings = Arc::new(SettingsCache::new(
            db.clone() as Arc<dyn SettingsProvider>,
            Duration::from_secs(config.settings.cache_ttl_secs),
        ));

        // A disabled sender fails every delivery, so invoices stay APPROVED.
        let sender = SmtpEmailSender::new(config.smtp.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize SMTP sender");
            e
        })?;
        if sender.is_enabled() {
            tracing::info!("SMTP email sender initialized");
        } else {
            tracing::warn!("SMTP disabled, invoice delivery will fail until it is configured");
        }
        let sender: Arc<dyn EmailSender> = Arc::new(sender);

        let renderer: Option<Arc<dyn DocumentRenderer>> = match &config.renderer {
            Some(renderer_config) => {
                let renderer = HttpDocumentRenderer::new(renderer_config)?;
                tracing::info!(url = %renderer_config.url, "Document renderer initialized");
                Some(Arc::new(renderer))
            }
            None => {
                tracing::info!("No document renderer configured, invoices are mailed without PDF");
                None
            }
        };

        let state = AppState::assemble(
            db,
            settings,
            InvoiceMailer::new(sender, renderer),
            Arc::new(TracingAuditSink),
        );

        // Bind HTTP listener
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing engine listener bound");

        Ok(Self {
            port,
            listener,
            scheduler: config.scheduler,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the HTTP server and, when enabled, the sweep loop until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let http_router = router(self.state.clone());

        tracing::info!(
            service = "billing-engine",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            sweep_enabled = self.scheduler.enabled,
            "Service ready to accept connections"
        );

        let Self {
            listener,
            scheduler,
            state,
            ..
        } = self;
        let sweep = async move {
            if scheduler.enabled {
                run_sweep_loop(state.executor, state.settings, scheduler.interval()).await
            } else {
                std::future::pending::<()>().await
            }
        };

        tokio::select! {
            result = axum::serve(listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            _ = sweep => {}
        }

        Ok(())
    }
}
