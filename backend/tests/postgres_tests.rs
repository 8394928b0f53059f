//! Store tests against a real PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use uuid::Uuid;

use terrareg_backend::config::Config;
use terrareg_backend::db::repository::NamespaceRepository;
use terrareg_backend::db::{self, with_transaction, Store, TxContext};
use terrareg_backend::error::AppError;
use terrareg_backend::models::namespace::{Namespace, NamespaceType};

async fn open() -> std::sync::Arc<dyn Store> {
    let config = Config {
        store_backend: "postgres".into(),
        database_url: Some(std::env::var("DATABASE_URL").expect("DATABASE_URL must be set")),
        ..Config::default()
    };
    db::open_store(&config).await.unwrap()
}

fn unique_name(prefix: &str) -> String {
    format!("{}{}", prefix, &Uuid::new_v4().simple().to_string()[..12])
}

#[tokio::test]
#[ignore]
async fn test_savepoint_rollback_keeps_outer_work() {
    let store = open().await;
    let store = store.as_ref();
    let outer = unique_name("outer");
    let inner = unique_name("inner");
    let ctx = TxContext::background();

    let result: terrareg_backend::Result<()> = with_transaction(store, &ctx, "outer", |tx| {
        let (outer, inner) = (outer.clone(), inner.clone());
        async move {
            let namespace = Namespace::new(&outer, None, NamespaceType::Organisation)?;
            store.save_namespace(&tx, &namespace).await?;

            let nested: terrareg_backend::Result<()> =
                with_transaction(store, &tx, "inner.stage-1", |tx| async move {
                    let namespace = Namespace::new(&inner, None, NamespaceType::Organisation)?;
                    store.save_namespace(&tx, &namespace).await?;
                    Err(AppError::Validation("abandon inner".into()))
                })
                .await;
            assert!(nested.is_err());
            Ok(())
        }
    })
    .await;
    result.unwrap();

    assert!(store.find_namespace(&ctx, &outer).await.unwrap().is_some());
    assert!(store.find_namespace(&ctx, &inner).await.unwrap().is_none());
    store.delete_namespace(&ctx, &outer).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_failed_transaction_persists_nothing() {
    let store = open().await;
    let store = store.as_ref();
    let name = unique_name("rolled");
    let ctx = TxContext::background();

    let result: terrareg_backend::Result<()> = with_transaction(store, &ctx, "rollback", |tx| {
        let name = name.clone();
        async move {
            let namespace = Namespace::new(&name, None, NamespaceType::User)?;
            store.save_namespace(&tx, &namespace).await?;
            Err(AppError::DomainViolation("stop".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(AppError::DomainViolation(_))));
    assert!(store.find_namespace(&ctx, &name).await.unwrap().is_none());
}
