//! Background task scheduler.
//!
//! Periodically removes expired authorization codes, access tokens and
//! sessions. Each row is deleted in its own savepoint so one failure does
//! not abort the sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::repository::{SessionRepository, TerraformIdpRepository};
use crate::db::{batch_with_savepoints, Store, TxContext};
use crate::error::Result;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const STARTUP_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub authorization_codes: usize,
    pub access_tokens: usize,
    pub sessions: usize,
    pub failed: usize,
}

/// Delete every expired authorization code, access token and session.
pub async fn sweep_expired(store: &dyn Store, ctx: &TxContext) -> Result<SweepReport> {
    let now = Utc::now();
    let mut report = SweepReport::default();

    let codes = store.list_expired_authorization_codes(ctx, now).await?;
    let outcome = batch_with_savepoints(store, ctx, "sweep_authorization_codes", codes, |tx, code| async move {
        store.delete_authorization_code(&tx, &code).await
    })
    .await?;
    report.authorization_codes = outcome.succeeded();
    report.failed += outcome.failed();

    let tokens = store.list_expired_access_tokens(ctx, now).await?;
    let outcome = batch_with_savepoints(store, ctx, "sweep_access_tokens", tokens, |tx, jti| async move {
        store.delete_access_token(&tx, &jti).await
    })
    .await?;
    report.access_tokens = outcome.succeeded();
    report.failed += outcome.failed();

    let sessions = store.list_expired_sessions(ctx, now).await?;
    let outcome = batch_with_savepoints(store, ctx, "sweep_sessions", sessions, |tx, id| async move {
        store.delete_session(&tx, &id).await
    })
    .await?;
    report.sessions = outcome.succeeded();
    report.failed += outcome.failed();

    Ok(report)
}

/// Spawn the background sweep. It stops when `shutdown` is cancelled.
pub fn spawn_all(store: Arc<dyn Store>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
        }
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ctx = TxContext::new(shutdown.child_token());
            match sweep_expired(store.as_ref(), &ctx).await {
                Ok(report) if report == SweepReport::default() => {
                    tracing::debug!("Expiry sweep found nothing to remove");
                }
                Ok(report) => {
                    tracing::info!(
                        authorization_codes = report.authorization_codes,
                        access_tokens = report.access_tokens,
                        sessions = report.sessions,
                        failed = report.failed,
                        "Expiry sweep completed"
                    );
                }
                Err(e) => tracing::warn!("Expiry sweep failed: {}", e),
            }
        }
        tracing::debug!("Scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::session::{Session, SessionPrincipal};
    use crate::models::terraform_idp::{AccessToken, AuthorizationCode};
    use chrono::Duration as ChronoDuration;

    fn code(name: &str, expires_in: i64) -> AuthorizationCode {
        let now = Utc::now();
        AuthorizationCode {
            code: name.into(),
            client_id: "terraform-cli".into(),
            redirect_uri: "http://localhost:10000/login".into(),
            scope: "openid".into(),
            state: "s".into(),
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            subject_identifier: None,
            expires_at: now + ChronoDuration::seconds(expires_in),
            exchanged_at: None,
            created_at: now,
        }
    }

    fn token(jti: &str, expires_in: i64) -> AccessToken {
        let now = Utc::now();
        AccessToken {
            jti: jti.into(),
            authorization_code: "c".into(),
            subject_identifier: None,
            scope: "openid".into(),
            expires_at: now + ChronoDuration::seconds(expires_in),
            created_at: now,
        }
    }

    fn session(id: &str, expires_in: i64) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            expires_at: now + ChronoDuration::seconds(expires_in),
            provider_source_auth: SessionPrincipal::Admin.to_blob().unwrap(),
            csrf_token: "csrf".into(),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_rows() {
        let store = MemoryStore::new();
        let ctx = TxContext::background();
        store.save_authorization_code(&ctx, &code("old", -60)).await.unwrap();
        store.save_authorization_code(&ctx, &code("fresh", 600)).await.unwrap();
        store.save_access_token(&ctx, &token("old-jti", -1)).await.unwrap();
        store.save_access_token(&ctx, &token("fresh-jti", 3600)).await.unwrap();
        store.save_session(&ctx, &session("old-session", -5)).await.unwrap();
        store.save_session(&ctx, &session("fresh-session", 60)).await.unwrap();

        let report = sweep_expired(&store, &ctx).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                authorization_codes: 1,
                access_tokens: 1,
                sessions: 1,
                failed: 0,
            }
        );
        assert!(store.find_authorization_code(&ctx, "old").await.unwrap().is_none());
        assert!(store.find_authorization_code(&ctx, "fresh").await.unwrap().is_some());
        assert!(store.find_access_token(&ctx, "fresh-jti").await.unwrap().is_some());
        assert!(store.find_session(&ctx, "fresh-session").await.unwrap().is_some());

        assert_eq!(sweep_expired(&store, &ctx).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_all(Arc::new(MemoryStore::new()), shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
