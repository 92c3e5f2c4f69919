// User registration walkthrough for the CQRS runtime

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cqrs::{
    async_trait, commands, handler_fn, saga_fn, AggregateRoot, Command, CommandEnvelope,
    CommandHandler, CommandInterceptor, CommandOutput, CqrsConfig, CqrsModule, EventPublisher,
    EventStream, Next, Query, Registrations,
};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone)]
struct RegisterUser {
    email: String,
}

impl Command for RegisterUser {
    type Output = u64;
}

#[derive(Debug, Clone)]
struct SendWelcomeEmail {
    user_id: u64,
    email: String,
}

impl Command for SendWelcomeEmail {
    type Output = ();
}

#[derive(Debug, Clone)]
struct GetUserEmail {
    user_id: u64,
}

impl Query for GetUserEmail {
    type Output = Option<String>;
}

#[derive(Debug, Clone)]
struct UserRegistered {
    user_id: u64,
    email: String,
}

// =============================================================================
// Handlers
// =============================================================================

struct RegisterUserHandler {
    users: Arc<DashMap<u64, String>>,
    next_id: AtomicU64,
    publisher: Arc<dyn EventPublisher>,
}

#[async_trait]
impl CommandHandler<RegisterUser> for RegisterUserHandler {
    async fn execute(&self, command: RegisterUser) -> Result<u64> {
        if !command.email.contains('@') {
            anyhow::bail!("invalid email address: {}", command.email);
        }

        let user_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.users.insert(user_id, command.email.clone());

        let mut root = AggregateRoot::new().with_publisher(self.publisher.clone());
        root.apply(UserRegistered {
            user_id,
            email: command.email,
        });
        root.commit().await;

        Ok(user_id)
    }
}

/// Logs how long each command took.
struct Timing;

#[async_trait]
impl CommandInterceptor for Timing {
    fn name(&self) -> &'static str {
        "timing"
    }

    async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
        let command_type = command.type_name();
        let start = Instant::now();
        let output = next.run(command).await;
        debug!(
            command_type,
            elapsed_us = start.elapsed().as_micros() as u64,
            ok = output.is_ok(),
            "command finished"
        );
        output
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cqrs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CqrsConfig::from_env().context("Failed to load configuration")?;
    info!(mode = %config.event_handler_mode, "Configuration loaded");

    let module = CqrsModule::new(config);
    let users: Arc<DashMap<u64, String>> = Arc::new(DashMap::new());
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();

    let lookup = users.clone();
    let registrations = Registrations::new()
        .with_command::<RegisterUser, _>(RegisterUserHandler {
            users: users.clone(),
            next_id: AtomicU64::new(0),
            publisher: module.publisher(),
        })
        .with_command::<SendWelcomeEmail, _>(handler_fn(move |cmd: SendWelcomeEmail| {
            let sent = sent_tx.clone();
            async move {
                info!(user_id = cmd.user_id, email = %cmd.email, "sending welcome email");
                let _ = sent.send(cmd.user_id);
                Ok(())
            }
        }))
        .with_query::<GetUserEmail, _>(handler_fn(move |query: GetUserEmail| {
            let email = lookup.get(&query.user_id).map(|entry| entry.value().clone());
            async move { Ok(email) }
        }))
        .with_event::<UserRegistered, _>(handler_fn(|event: UserRegistered| async move {
            info!(user_id = event.user_id, "audit: user registered");
            Ok(())
        }))
        .with_event::<UserRegistered, _>(handler_fn(|event: UserRegistered| async move {
            if event.email.ends_with("@example.invalid") {
                anyhow::bail!("crm sync rejected {}", event.email);
            }
            Ok(())
        }))
        .with_interceptor(Timing)
        .with_saga(saga_fn("welcome", |events: EventStream| {
            commands(events.of_type::<UserRegistered>().map(|event| SendWelcomeEmail {
                user_id: event.user_id,
                email: event.email,
            }))
        }));

    module
        .bootstrap(&registrations)
        .context("Failed to bootstrap CQRS module")?;

    let _failures = module.unhandled_exceptions().subscribe_fn(|info| {
        warn!(id = %info.id, source = %info.source, "unhandled failure observed");
    });

    for email in ["ada@example.com", "grace@example.invalid"] {
        let user_id = module
            .execute_command(RegisterUser {
                email: email.to_string(),
            })
            .await?;
        info!(user_id, email, "registered");
    }

    if let Err(err) = module
        .execute_command(RegisterUser {
            email: "not-an-email".into(),
        })
        .await
    {
        warn!(error = %err, "registration rejected");
    }

    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), sent_rx.recv()).await {
            Ok(Some(user_id)) => info!(user_id, "welcome email delivered"),
            _ => warn!("welcome email did not arrive in time"),
        }
    }

    let email = module.execute_query(GetUserEmail { user_id: 1 }).await?;
    info!(?email, "looked up user 1");

    module.shutdown();
    info!("Shut down");

    Ok(())
}
