use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};

use storefront_api as api;
use api::{
    gateways::{
        DisabledFulfillmentProvider, DisabledPaymentGateway, FulfillmentProvider, PayPalGateway,
        PaymentGateway, PrintifyClient,
    },
    rate_limiter::{RateLimitConfig, SlidingWindowLimiter},
    services::{notifications::LogNotifier, stock_ledger::spawn_reservation_sweeper},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    let gateway: Arc<dyn PaymentGateway> = match cfg.paypal_credentials() {
        Some((client_id, client_secret)) => {
            info!("PayPal payments enabled");
            Arc::new(PayPalGateway::new(
                cfg.paypal_base_url.clone(),
                client_id,
                client_secret,
                cfg.external_timeout(),
            )?)
        }
        None => {
            warn!("PayPal credentials not configured; payments are disabled");
            Arc::new(DisabledPaymentGateway)
        }
    };

    let provider: Arc<dyn FulfillmentProvider> = match cfg.printify_credentials() {
        Some((api_token, shop_id)) => {
            info!(shop_id = %shop_id, "Printify fulfillment enabled");
            let limiter = SlidingWindowLimiter::new(RateLimitConfig::per_minute(
                cfg.printify_requests_per_minute,
                "printify",
            ))
            .context("invalid Printify rate limit")?;
            Arc::new(PrintifyClient::new(
                cfg.printify_base_url.clone(),
                api_token,
                shop_id,
                Arc::new(limiter),
                cfg.external_timeout(),
            )?)
        }
        None => {
            warn!("Printify credentials not configured; print-on-demand lines will fail");
            Arc::new(DisabledFulfillmentProvider)
        }
    };

    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        &cfg,
        gateway,
        provider,
        Arc::new(LogNotifier),
    );

    let sweeper = cfg.sweep_interval().map(|interval| {
        spawn_reservation_sweeper(services.ledger.clone(), cfg.reservation_ttl_hours, interval)
    });

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;

    let state = api::AppState {
        db: db_arc,
        config: Arc::new(cfg),
        event_sender,
        services,
    };
    let app = api::app(state, REQUEST_TIMEOUT);

    // Bind and serve
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
