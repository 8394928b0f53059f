//! Context-carried transactions with nested savepoints.
//!
//! [`with_transaction`] is the only way to obtain a transaction handle. The
//! outermost call begins a transaction; nested calls on the returned context
//! create uniquely named savepoints. Errors roll back to the enclosing
//! savepoint (or the whole transaction) and are propagated unchanged.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

const MAX_SAVEPOINT_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
    /// In-process store without SQL.
    Memory,
}

impl SqlDialect {
    /// Quote an already sanitised identifier.
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            SqlDialect::Postgres | SqlDialect::Sqlite => format!("\"{}\"", name),
            SqlDialect::MySql => format!("`{}`", name),
            SqlDialect::Memory => name.to_string(),
        }
    }
}

/// Reduce an arbitrary label to `[A-Za-z_][A-Za-z0-9_]{0,63}`.
pub fn sanitize_savepoint_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
    {
        name.insert_str(0, "sp_");
    }
    name.truncate(MAX_SAVEPOINT_NAME_LEN);
    name
}

/// Database-specific transaction operations.
#[async_trait]
pub trait TransactionHandle: Send {
    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
    /// Lets a store recover its concrete handle type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A store that can open transactions.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TransactionHandle>>;
    fn dialect(&self) -> SqlDialect;
}

pub type HandleSlot = Option<Box<dyn TransactionHandle>>;

struct ActiveTransaction {
    handle: Arc<Mutex<HandleSlot>>,
    dialect: SqlDialect,
    sequence: AtomicU64,
}

impl ActiveTransaction {
    fn next_savepoint_name(&self, label: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix = format!("_{}", seq);
        let mut base = sanitize_savepoint_name(label);
        base.truncate(MAX_SAVEPOINT_NAME_LEN - suffix.len());
        format!("{}{}", base, suffix)
    }

    async fn with_handle<'a>(
        &'a self,
    ) -> Result<tokio::sync::MutexGuard<'a, HandleSlot>> {
        let guard = self.handle.lock().await;
        if guard.is_none() {
            return Err(AppError::Internal("Transaction already finished".into()));
        }
        Ok(guard)
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.with_handle().await?;
        match guard.as_mut() {
            Some(handle) => handle.savepoint(name).await,
            None => Err(AppError::Internal("Transaction already finished".into())),
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut guard = self.with_handle().await?;
        match guard.as_mut() {
            Some(handle) => handle.release_savepoint(name).await,
            None => Err(AppError::Internal("Transaction already finished".into())),
        }
    }

    async fn rollback_to(&self, name: &str) -> Result<()> {
        let mut guard = self.with_handle().await?;
        match guard.as_mut() {
            Some(handle) => {
                handle.rollback_to_savepoint(name).await?;
                handle.release_savepoint(name).await
            }
            None => Err(AppError::Internal("Transaction already finished".into())),
        }
    }

    async fn take(&self) -> Option<Box<dyn TransactionHandle>> {
        self.handle.lock().await.take()
    }
}

/// Carries the active transaction (if any) and the cancellation handle.
#[derive(Clone, Default)]
pub struct TxContext {
    tx: Option<Arc<ActiveTransaction>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("in_transaction", &self.tx.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TxContext {
    /// Context without a transaction.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    pub fn background() -> Self {
        Self::default()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn dialect(&self) -> Option<SqlDialect> {
        self.tx.as_ref().map(|t| t.dialect)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Exclusive access to the transaction handle for running statements.
    pub async fn lock_handle(&self) -> Option<OwnedMutexGuard<HandleSlot>> {
        match &self.tx {
            Some(active) => Some(active.handle.clone().lock_owned().await),
            None => None,
        }
    }
}

/// Run `f` inside a transaction, or inside a savepoint when `ctx` already
/// carries one.
pub async fn with_transaction<B, F, Fut, T>(
    backend: &B,
    ctx: &TxContext,
    label: &str,
    f: F,
) -> Result<T>
where
    B: TransactionBackend + ?Sized,
    F: FnOnce(TxContext) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    ctx.check_cancelled()?;

    if let Some(active) = &ctx.tx {
        let savepoint = active.next_savepoint_name(label);
        active.savepoint(&savepoint).await?;
        return match f(ctx.clone()).await {
            Ok(value) => {
                active.release(&savepoint).await?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(savepoint = %savepoint, error = %err, "Rolling back savepoint");
                if let Err(rollback_err) = active.rollback_to(&savepoint).await {
                    tracing::warn!(
                        savepoint = %savepoint,
                        "Failed to roll back savepoint: {}",
                        rollback_err
                    );
                }
                Err(err)
            }
        };
    }

    let handle = backend.begin().await?;
    let active = Arc::new(ActiveTransaction {
        handle: Arc::new(Mutex::new(Some(handle))),
        dialect: backend.dialect(),
        sequence: AtomicU64::new(0),
    });
    let inner = TxContext {
        tx: Some(active.clone()),
        cancel: ctx.cancel.clone(),
    };

    let result = match f(inner).await {
        Ok(_) if ctx.cancel.is_cancelled() => Err(AppError::Cancelled),
        other => other,
    };

    let Some(handle) = active.take().await else {
        return Err(AppError::Internal("Transaction handle lost".into()));
    };
    match result {
        Ok(value) => {
            handle.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tracing::debug!(label, error = %err, "Rolling back transaction");
            if let Err(rollback_err) = handle.rollback().await {
                tracing::warn!(label, "Failed to roll back transaction: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// Outcome of one item of [`batch_with_savepoints`].
#[derive(Debug)]
pub struct BatchItemResult<T> {
    pub index: usize,
    pub result: Result<T>,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub items: Vec<BatchItemResult<T>>,
}

impl<T> BatchOutcome<T> {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Run each item in its own savepoint; a failing item only rolls back itself.
pub async fn batch_with_savepoints<B, I, F, Fut, T>(
    backend: &B,
    ctx: &TxContext,
    label: &str,
    items: Vec<I>,
    f: F,
) -> Result<BatchOutcome<T>>
where
    B: TransactionBackend + ?Sized,
    I: Send,
    F: Fn(TxContext, I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let item_label = format!("{}_item", label);
    with_transaction(backend, ctx, label, |tx| async move {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let started = Instant::now();
            let result =
                with_transaction(backend, &tx, &item_label, |inner| f(inner, item)).await;
            results.push(BatchItemResult {
                index,
                result,
                duration: started.elapsed(),
            });
        }
        Ok(BatchOutcome { items: results })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every statement it would have executed.
    #[derive(Clone, Default)]
    struct RecordingBackend {
        log: Arc<StdMutex<Vec<String>>>,
    }

    struct RecordingHandle {
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl RecordingHandle {
        fn push(&self, entry: String) {
            if let Ok(mut log) = self.log.lock() {
                log.push(entry);
            }
        }
    }

    #[async_trait]
    impl TransactionHandle for RecordingHandle {
        async fn savepoint(&mut self, name: &str) -> Result<()> {
            self.push(format!("SAVEPOINT {}", SqlDialect::Postgres.quote_identifier(name)));
            Ok(())
        }
        async fn release_savepoint(&mut self, name: &str) -> Result<()> {
            self.push(format!("RELEASE {}", name));
            Ok(())
        }
        async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
            self.push(format!("ROLLBACK TO {}", name));
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.push("COMMIT".into());
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> Result<()> {
            self.push("ROLLBACK".into());
            Ok(())
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[async_trait]
    impl TransactionBackend for RecordingBackend {
        async fn begin(&self) -> Result<Box<dyn TransactionHandle>> {
            if let Ok(mut log) = self.log.lock() {
                log.push("BEGIN".into());
            }
            Ok(Box::new(RecordingHandle {
                log: self.log.clone(),
            }))
        }
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Postgres
        }
    }

    impl RecordingBackend {
        fn entries(&self) -> Vec<String> {
            self.log.lock().map(|l| l.clone()).unwrap_or_default()
        }
    }

    #[test]
    fn test_sanitize_savepoint_name() {
        assert_eq!(sanitize_savepoint_name("persist.module-v1"), "persist_module_v1");
        assert_eq!(sanitize_savepoint_name("1stage"), "sp_1stage");
        assert_eq!(sanitize_savepoint_name(""), "sp_");
        assert_eq!(sanitize_savepoint_name(&"x".repeat(100)).len(), 64);
        assert_eq!(sanitize_savepoint_name("a\"; DROP TABLE x"), "a___DROP_TABLE_x");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(SqlDialect::Postgres.quote_identifier("sp_1"), "\"sp_1\"");
        assert_eq!(SqlDialect::MySql.quote_identifier("sp_1"), "`sp_1`");
    }

    #[tokio::test]
    async fn test_outer_transaction_commits() {
        let backend = RecordingBackend::default();
        let value = with_transaction(&backend, &TxContext::background(), "outer", |tx| async move {
            assert!(tx.is_in_transaction());
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(backend.entries(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_nested_failure_rolls_back_savepoint_only() {
        let backend = RecordingBackend::default();
        let b = &backend;
        let result = with_transaction(b, &TxContext::background(), "outer", |tx| async move {
            let inner: Result<()> = with_transaction(b, &tx, "stage.parse", |_| async {
                Err(AppError::ParseFailed("bad".into()))
            })
            .await;
            assert!(matches!(inner, Err(AppError::ParseFailed(_))));
            Ok(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(
            backend.entries(),
            vec![
                "BEGIN",
                "SAVEPOINT \"stage_parse_0\"",
                "ROLLBACK TO stage_parse_0",
                "RELEASE stage_parse_0",
                "COMMIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_outer_failure_rolls_back() {
        let backend = RecordingBackend::default();
        let result: Result<()> =
            with_transaction(&backend, &TxContext::background(), "outer", |_| async {
                Err(AppError::Validation("nope".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(backend.entries(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_savepoint_names_are_unique() {
        let backend = RecordingBackend::default();
        let b = &backend;
        with_transaction(b, &TxContext::background(), "outer", |tx| async move {
            with_transaction(b, &tx, "same", |_| async { Ok(()) }).await?;
            with_transaction(b, &tx, "same", |_| async { Ok(()) }).await?;
            Ok(())
        })
        .await
        .unwrap();
        let entries = backend.entries();
        assert!(entries.contains(&"SAVEPOINT \"same_0\"".to_string()));
        assert!(entries.contains(&"SAVEPOINT \"same_1\"".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_context_rolls_back() {
        let backend = RecordingBackend::default();
        let cancel = CancellationToken::new();
        let ctx = TxContext::new(cancel.clone());
        let result = with_transaction(&backend, &ctx, "outer", |_| async move {
            cancel.cancel();
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(backend.entries(), vec!["BEGIN", "ROLLBACK"]);

        let result: Result<()> =
            with_transaction(&backend, &ctx, "again", |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_batch_with_savepoints_collects_per_item_results() {
        let backend = RecordingBackend::default();
        let outcome = batch_with_savepoints(
            &backend,
            &TxContext::background(),
            "sweep",
            vec![1, 2, 3],
            |_, item| async move {
                if item == 2 {
                    Err(AppError::Internal("boom".into()))
                } else {
                    Ok(item * 10)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.succeeded(), 2);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.items[2].result.as_ref().unwrap(), &30);
        assert_eq!(backend.entries().last().map(String::as_str), Some("COMMIT"));
    }
}
