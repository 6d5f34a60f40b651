//! Force-rollback mode: one shared connection, every checkout rolled back.

mod common;

use common::*;
use fastpg::{FastpgResult, TransactionState, Value};
use std::time::Duration;

#[tokio::test]
async fn test_writes_are_invisible_to_later_checkouts() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let mut conn = db.connection().await?;
    let mut tx = conn.transaction(false).await?;
    tx.execute(INSERT, Some(&name("a"))).await?;
    assert_eq!(tx.commit().await?, TransactionState::Committed);
    // Visible inside the checkout that wrote it.
    assert_eq!(conn.fetch_value(COUNT, None).await?, Some(Value::Int(1)));
    conn.release().await?;

    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    assert!(driver.committed().is_empty());

    db.disconnect(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_convenience_methods_roll_back_too() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    db.execute(INSERT, Some(&name("a"))).await?;
    db.execute_many(INSERT, &[name("b"), name("c")]).await?;

    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    assert!(db.fetch_many("SELECT name FROM items", None).await?.is_empty());
    assert!(driver.committed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_one_connection_for_every_checkout() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let first = db.fetch_value(CONNECTION_ID, None).await?;
    let second = db.fetch_value(CONNECTION_ID, None).await?;
    assert_eq!(first, second);

    let state = driver.state();
    assert_eq!(state.opened, 1);
    assert_eq!(state.acquired, 0);
    Ok(())
}

#[tokio::test]
async fn test_checkouts_are_serialized() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let first = db.connection().await?;
    let blocked = tokio::time::timeout(Duration::from_millis(50), db.connection()).await;
    assert!(blocked.is_err());

    first.release().await?;
    let second = tokio::time::timeout(Duration::from_secs(1), db.connection())
        .await
        .expect("checkout should proceed once the first is released")?;
    second.release().await?;

    assert_eq!(
        driver.log(),
        vec!["BEGIN", "ROLLBACK", "BEGIN", "ROLLBACK"]
    );
    Ok(())
}

#[tokio::test]
async fn test_disconnect_closes_shared_connection() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;
    assert!(db.is_force_rollback());

    db.disconnect_default().await?;
    assert_eq!(driver.state().closed_connections, 1);
    assert!(!db.is_connected().await);
    Ok(())
}

#[tokio::test]
async fn test_dropped_scope_inside_checkout_is_discarded() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let mut conn = db.connection().await?;
    {
        let mut tx = conn.transaction(false).await?;
        tx.execute(INSERT, Some(&name("a"))).await?;
    }
    conn.release().await?;

    assert!(driver.committed().is_empty());
    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    assert_eq!(
        driver.log(),
        vec![
            "BEGIN",
            "SAVEPOINT",
            "INSERT INTO items (name) VALUES ($1)",
            "ROLLBACK TO SAVEPOINT",
            "ROLLBACK",
            "BEGIN",
            COUNT,
            "ROLLBACK",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_interrupted_release_is_finished_by_next_checkout() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let mut conn = db.connection().await?;
    conn.execute(INSERT, Some(&name("a"))).await?;

    driver.state().rollback_delay = Some(Duration::from_secs(5));
    let interrupted = tokio::time::timeout(Duration::from_millis(20), conn.release()).await;
    assert!(interrupted.is_err());
    driver.state().rollback_delay = None;

    // The next checkout starts from a clean connection, not inside the
    // interrupted one's transaction.
    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    assert_eq!(
        driver.log(),
        vec![
            "BEGIN",
            "INSERT INTO items (name) VALUES ($1)",
            "ROLLBACK",
            "BEGIN",
            COUNT,
            "ROLLBACK",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_close_ends_checkout_but_keeps_shared_connection() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let mut conn = db.connection().await?;
    conn.execute(INSERT, Some(&name("a"))).await?;
    conn.close(Duration::from_secs(1)).await?;

    assert_eq!(driver.state().closed_connections, 0);
    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    Ok(())
}

#[tokio::test]
async fn test_checkout_dropped_off_runtime_is_rolled_back_later() -> FastpgResult<()> {
    let driver = MockDriver::new();
    let db = force_rollback_db(&driver);
    db.connect().await?;

    let mut conn = db.connection().await?;
    conn.execute(INSERT, Some(&name("a"))).await?;
    std::thread::spawn(move || drop(conn)).join().unwrap();

    assert_eq!(db.fetch_value(COUNT, None).await?, Some(Value::Int(0)));
    assert_eq!(driver.log()[2..4], ["ROLLBACK", "BEGIN"]);
    Ok(())
}
