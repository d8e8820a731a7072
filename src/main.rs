//! `devpair` command line: drive both sides of a pairing against the
//! configured row store.
//!
//! Results go to stdout as JSON; logs go to stderr (`RUST_LOG`, default
//! `devpair=info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use devpair::clock::{session_tag, Clock, SystemClock};
use devpair::config::{Config, StoreBackend};
use devpair::pairing::{PairingPayload, PairingService, PollOutcome, Poller, StoreLocator};
use devpair::retry::RetryPolicy;
use devpair::session::SessionRepository;
use devpair::store::{
    MemoryRowStore, RowStore, SheetsConfig, SheetsRowStore, SqliteRowStore, ThrottledStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "devpair", version)]
#[command(about = "Pair two devices through a shared row store")]
struct Cli {
    /// Config file (default: ~/.devpair/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Primary: create a session and print its QR payload
    Create {
        /// Fingerprint of this (primary) device
        #[arg(long)]
        fingerprint: String,
    },
    /// Secondary: verify a session from its id or scanned payload
    Verify {
        /// Session id
        #[arg(long, required_unless_present = "payload", conflicts_with = "payload")]
        session: Option<String>,
        /// Scanned QR payload (JSON)
        #[arg(long)]
        payload: Option<String>,
        /// Fingerprint of this (secondary) device
        #[arg(long)]
        fingerprint: String,
        /// User identity to bind to the session
        #[arg(long)]
        user: String,
    },
    /// Primary: poll a session once
    Poll {
        #[arg(long)]
        session: String,
    },
    /// Primary: poll until paired, expired or Ctrl-C
    Watch {
        #[arg(long)]
        session: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List stored sessions with their derived status
    Inspect {
        /// Print full session ids instead of log tags
        #[arg(long)]
        reveal: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devpair=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let service = Arc::new(build_service(&config)?);

    match cli.command {
        Commands::Create { fingerprint } => {
            let created = service.create_session(&fingerprint).await?;
            print_json(&serde_json::json!({
                "sessionId": created.session_id,
                "createdAt": created.created_at,
                "expiresAt": created.expires_at,
                "payload": created.payload.encode()?,
            }))?;
        }
        Commands::Verify {
            session,
            payload,
            fingerprint,
            user,
        } => {
            let session_id = match (session, payload) {
                (Some(id), _) => id,
                (None, Some(raw)) => session_from_payload(&service, &raw)?,
                (None, None) => anyhow::bail!("Either --session or --payload is required"),
            };
            let verified = service
                .verify_session(&session_id, &fingerprint, &user)
                .await?;
            print_json(&serde_json::to_value(&verified)?)?;
        }
        Commands::Poll { session } => {
            let result = service.poll_once(&session).await;
            print_json(&serde_json::json!({
                "verified": result.verified,
                "session": result.session,
                "error": result.error.map(|e| e.to_string()),
            }))?;
        }
        Commands::Watch {
            session,
            timeout_secs,
        } => watch(&service, &config, &session, timeout_secs).await?,
        Commands::Inspect { reveal } => inspect(&service, reveal).await?,
    }

    Ok(())
}

/// Wire the configured store, throttle and retry policy into a service.
fn build_service(config: &Config) -> anyhow::Result<PairingService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sheet = config.store.sheet.clone();
    let quota = config.store.quota_per_minute;

    let (store, locator): (Arc<dyn RowStore>, String) = match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config.sqlite_path()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let inner = SqliteRowStore::open(&path, &sheet)?;
            let store: Arc<dyn RowStore> =
                Arc::new(ThrottledStore::new(inner, clock.clone(), quota));
            (store, path.display().to_string())
        }
        StoreBackend::Sheets => {
            let spreadsheet_id = config
                .store
                .spreadsheet_id
                .clone()
                .context("store.spreadsheet_id (or DEVPAIR_SPREADSHEET_ID) is required")?;
            let access_token = config
                .sheets_token
                .clone()
                .context("DEVPAIR_SHEETS_TOKEN is required for the sheets backend")?;
            let inner = SheetsRowStore::new(SheetsConfig {
                api_base: config.store.api_base.clone(),
                spreadsheet_id: spreadsheet_id.clone(),
                sheet: sheet.clone(),
                access_token,
                timeout: Duration::from_secs(config.store.timeout_secs),
            })?;
            let store: Arc<dyn RowStore> =
                Arc::new(ThrottledStore::new(inner, clock.clone(), quota));
            (store, spreadsheet_id)
        }
        StoreBackend::Memory => {
            tracing::warn!("Memory backend does not persist across invocations");
            let store: Arc<dyn RowStore> =
                Arc::new(ThrottledStore::new(MemoryRowStore::new(), clock.clone(), quota));
            (store, "memory".to_string())
        }
    };

    tracing::debug!(store = store.name(), sheet = %sheet, "Row store ready");
    Ok(PairingService::new(
        SessionRepository::new(store, config.pairing.ttl()),
        clock,
        RetryPolicy::from_config(&config.retry),
        StoreLocator {
            store: locator,
            sheet,
        },
    ))
}

/// Session id from a scanned payload, refusing payloads for another store.
fn session_from_payload(service: &PairingService, raw: &str) -> anyhow::Result<String> {
    let payload = PairingPayload::decode(raw)?;
    if payload.locator() != *service.locator() {
        anyhow::bail!(
            "Payload points at store {:?} sheet {:?}, but this device is configured for {:?} sheet {:?}",
            payload.store,
            payload.sheet,
            service.locator().store,
            service.locator().sheet
        );
    }
    if payload.is_expired_at(service.clock().now_ms()) {
        tracing::warn!(
            session = %session_tag(&payload.session_id),
            "Payload expiry has passed; the store will have the final word"
        );
    }
    Ok(payload.session_id)
}

async fn watch(
    service: &Arc<PairingService>,
    config: &Config,
    session_id: &str,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }
    let deadline =
        timeout_secs.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));

    let poller = Poller::new(service.clone(), config.pairing.poller());
    match poller.run(session_id, None, deadline, &cancel).await {
        PollOutcome::Paired { user_id, session } => {
            print_json(&serde_json::json!({
                "outcome": "paired",
                "userId": user_id,
                "session": session,
            }))?;
            Ok(())
        }
        PollOutcome::Cancelled => {
            print_json(&serde_json::json!({ "outcome": "cancelled" }))?;
            Ok(())
        }
        PollOutcome::Expired => anyhow::bail!("Session expired; create a new one"),
        PollOutcome::NotFound => anyhow::bail!("Session not found"),
        PollOutcome::TransientFailure(err) => {
            Err(err).context("Row store kept failing; try again")
        }
        PollOutcome::Failed(err) => Err(err.into()),
    }
}

async fn inspect(service: &PairingService, reveal: bool) -> anyhow::Result<()> {
    let (sessions, malformed) = service.repository().list().await?;
    let now = service.clock().now_ms();

    let rows: Vec<serde_json::Value> = sessions
        .iter()
        .map(|s| {
            let id = if reveal {
                s.session_id.clone()
            } else {
                session_tag(&s.session_id)
            };
            serde_json::json!({
                "row": s.row_ref.map(|r| r.position()),
                "session": id,
                "status": s.status_at(now),
                "createdAt": rfc3339(s.created_at),
                "expiresAt": rfc3339(s.expires_at),
                "userId": s.user_id,
            })
        })
        .collect();
    let malformed: Vec<serde_json::Value> = malformed
        .iter()
        .map(|(row_ref, detail)| serde_json::json!({ "row": row_ref.position(), "error": detail }))
        .collect();

    print_json(&serde_json::json!({ "sessions": rows, "malformed": malformed }))
}

fn rfc3339(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| epoch_ms.to_string())
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
