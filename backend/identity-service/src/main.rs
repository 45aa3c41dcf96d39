/// Identity Service Main Entry Point
///
/// Starts:
/// - User repository (PostgreSQL, or in-memory when no database is set)
/// - Event sink (Kafka or in-process channel)
/// - Projection consumer applying user events to the repository
/// - Identity use-case service with the configured providers
use anyhow::{Context, Result};
use identity_service::{
    config::{EventBusProvider, ProviderSettings, Settings},
    db::{InMemoryUserRepository, PostgresUserRepository, UserRepository},
    domain::{EventPublisher, SocialProvider},
    security::TokenIssuer,
    services::{
        inproc, GoogleVerifier, IdentityService, KafkaEventSink, KafkaProjectionConsumer,
        LineLogin, LineVerifier, PasskeyClient, PasskeysVerifier, ProjectionConsumerConfig,
        ProjectionHandler, VerifierRegistry,
    },
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "identity_service=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting Identity Service");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    let repo: Arc<dyn UserRepository> = match settings.database.url.as_deref() {
        Some(url) => {
            let repo = PostgresUserRepository::connect(url, settings.database.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!(
                "Database pool initialized with {} max connections",
                settings.database.max_connections
            );
            Arc::new(repo)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory user repository");
            Arc::new(InMemoryUserRepository::new())
        }
    };

    let handler = ProjectionHandler::new(repo.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (publisher, projection_task, kafka_sink) = match settings.event_bus.provider {
        EventBusProvider::Kafka => {
            let brokers = settings.event_bus.brokers.join(",");
            let sink = KafkaEventSink::new(&brokers, &settings.event_bus.topic)
                .context("Failed to initialize Kafka producer")?;

            let consumer = Arc::new(
                KafkaProjectionConsumer::new(
                    ProjectionConsumerConfig {
                        brokers,
                        group_id: settings.event_bus.group_id.clone(),
                        topic: settings.event_bus.topic.clone(),
                    },
                    handler,
                )
                .context("Failed to initialize Kafka consumer")?,
            );
            info!("Kafka event bus initialized");

            (
                EventPublisher::new(Arc::new(sink.clone())),
                tokio::spawn(consumer.run(shutdown_rx)),
                Some(sink),
            )
        }
        EventBusProvider::InProc => {
            let (sink, worker) = inproc::channel(handler);
            info!("In-process event bus initialized");

            let task = tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            });
            (EventPublisher::new(Arc::new(sink)), task, None)
        }
    };

    let http = reqwest::Client::new();
    let verifiers = Arc::new(build_verifiers(&settings.providers, &http));

    let tokens = TokenIssuer::from_pem(
        &settings.jwt.private_key,
        &settings.jwt.public_key,
        settings.jwt.issuer.clone(),
        settings.jwt.audiences.clone(),
        chrono::Duration::seconds(settings.jwt.timeout_secs),
    )
    .context("Failed to initialize session token keys")?;
    info!("Session token keys initialized");

    let mut service = IdentityService::new(repo.clone(), verifiers, publisher, Arc::new(tokens));
    if let Some(line) = &settings.providers.line {
        service = service.with_line_login(Arc::new(LineLogin::new(
            http.clone(),
            line.channel_id.clone(),
            line.channel_secret.clone(),
            line.redirect_uri.clone(),
        )));
    }
    if let Some(passkeys) = &settings.providers.passkeys {
        service = service.with_passkeys(Arc::new(PasskeyClient::new(
            http.clone(),
            &passkeys.base_url,
            &passkeys.tenant_id,
            passkeys.api_key.clone(),
        )));
    }
    info!("Identity service ready");

    shutdown_signal().await;

    // Stop publishing before stopping the projection consumer
    drop(service);
    let _ = shutdown_tx.send(true);
    if let Err(e) = projection_task.await {
        error!("Projection task failed: {}", e);
    }
    if let Some(sink) = kafka_sink {
        sink.flush();
    }

    repo.close().await.context("Failed to close repository")?;
    info!("Identity service shutdown complete");

    Ok(())
}

fn build_verifiers(providers: &ProviderSettings, http: &reqwest::Client) -> VerifierRegistry {
    let mut registry = VerifierRegistry::new();

    if let Some(client_id) = &providers.google_client_id {
        registry.register(
            SocialProvider::Google,
            Arc::new(GoogleVerifier::new(http.clone())),
            Some(client_id.clone()),
        );
        info!("Google sign-in enabled");
    }

    if let Some(line) = &providers.line {
        registry.register(
            SocialProvider::Line,
            Arc::new(LineVerifier::new(http.clone())),
            Some(line.channel_id.clone()),
        );
        info!("LINE sign-in enabled");
    }

    if let Some(passkeys) = &providers.passkeys {
        registry.register(
            SocialProvider::Passkeys,
            Arc::new(PasskeysVerifier::new(
                http.clone(),
                &passkeys.base_url,
                &passkeys.tenant_id,
            )),
            Some(passkeys.audience.clone()),
        );
        info!("Passkeys sign-in enabled");
    }

    registry
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
