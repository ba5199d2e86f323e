//! Application startup and lifecycle management.

use crate::billing::{BillingDriver, DriverSettings, SettlementOrchestrator};
use crate::billing::payment::{AccessProvisioner, PaymentGateway};
use crate::config::BillingConfig;
use crate::models::BillingRunKind;
use crate::services::{get_metrics, init_metrics, Database, MpesaGateway, RouterOsProvisioner};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get,
    routing::post, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Arc<Database>,
    pub orchestrator: Arc<SettlementOrchestrator>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Asynchronous payment notification from the gateway collaborator.
#[derive(Debug, Deserialize)]
pub struct PaymentResultNotice {
    pub invoice_id: Uuid,
    pub success: bool,
    pub receipt_ref: Option<String>,
}

/// Map the gateway's asynchronous payment result onto invoice state.
async fn payment_result(
    State(state): State<AppState>,
    Json(notice): Json<PaymentResultNotice>,
) -> Result<StatusCode, AppError> {
    state
        .orchestrator
        .payment_result(
            state.db.as_ref(),
            notice.invoice_id,
            notice.success,
            notice.receipt_ref.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
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
        init_metrics();

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

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let gateway: Arc<dyn PaymentGateway> = Arc::new(MpesaGateway::new(config.mpesa.clone()));
        let provisioner: Arc<dyn AccessProvisioner> =
            Arc::new(RouterOsProvisioner::new(config.routeros.clone()));
        let orchestrator = Arc::new(SettlementOrchestrator::new(gateway, provisioner));

        let state = AppState {
            config: config.clone(),
            db,
            orchestrator,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the HTTP surface and the billing scheduler until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .route("/payments/result", post(payment_result))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state.clone());

        let settings = DriverSettings {
            worker_count: self.state.config.billing.worker_count,
            due_days: self.state.config.billing.due_days,
            auto_charge: self.state.config.billing.auto_charge,
        };
        let driver = BillingDriver::new(
            self.state.db.clone(),
            self.state.orchestrator.clone(),
            settings,
        );
        let pass_interval = self.state.config.billing.pass_interval_secs;

        // The scheduler is a thin wrapper: it only supplies `now`. All
        // billing decisions re-derive from durable state, so an aborted pass
        // resumes safely on the next tick.
        let scheduler = async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(pass_interval.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match driver.run_pass(Utc::now(), BillingRunKind::Scheduled).await {
                    Ok(summary) => {
                        tracing::debug!(
                            processed = summary.processed,
                            invoices = summary.invoices,
                            "Scheduled billing pass complete"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Billing pass failed"),
                }
                if let Err(e) = driver.sweep_overdue(Utc::now()).await {
                    tracing::error!(error = %e, "Overdue sweep failed");
                }
            }
        };

        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            pass_interval_secs = pass_interval,
            "Service ready"
        );

        tokio::select! {
            result = axum::serve(self.listener, router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            _ = scheduler => {}
        }

        Ok(())
    }
}
