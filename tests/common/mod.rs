//! In-memory driver for integration tests.
//!
//! Rows are plain strings. A connection's open transactions are a stack of
//! layers: writes land in the top layer, commit folds it into the layer
//! below (or the shared table), rollback discards it.
//!
//! Recognised SQL:
//! - `INSERT ...` stores the first argument
//! - anything containing `FAIL` errors
//! - `SELECT connection_id()` returns the connection's id
//! - anything containing `count` returns the number of visible rows
//! - any other query echoes its first argument

#![allow(dead_code)]

use async_trait::async_trait;
use fastpg::driver::{Driver, DriverConnection, DriverPool, DriverResult};
use fastpg::{ConnectOptions, Database, DatabaseConfig, DriverValue, Params, RawRow, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const INSERT: &str = "INSERT INTO items (name) VALUES (:name)";
pub const COUNT: &str = "SELECT count(*) FROM items";
pub const CONNECTION_ID: &str = "SELECT connection_id()";

#[derive(Debug, Default)]
pub struct MockState {
    /// Rows visible to every connection
    pub committed: Vec<String>,
    /// Every statement, in the order it reached a connection
    pub log: Vec<String>,
    pub opened: usize,
    pub acquired: usize,
    pub released: usize,
    pub closed_connections: usize,
    pub pool_closed: bool,
    pub terminated: bool,
    /// Make every rollback fail
    pub fail_rollback: bool,
    /// Hold every rollback this long before it reaches the connection
    pub rollback_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    close_delay: Option<Duration>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pools from this driver take `delay` to close gracefully.
    pub fn with_close_delay(delay: Duration) -> Self {
        Self {
            close_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn committed(&self) -> Vec<String> {
        self.state().committed.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    fn open(&self) -> MockConnection {
        let mut state = self.state();
        state.opened += 1;
        MockConnection {
            id: state.opened as i64,
            state: self.state.clone(),
            layers: Vec::new(),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;
    type Pool = MockPool;

    async fn connect(&self, _dsn: &str, _options: &ConnectOptions) -> DriverResult<MockConnection> {
        Ok(self.open())
    }

    async fn create_pool(&self, _dsn: &str, _options: &ConnectOptions) -> DriverResult<MockPool> {
        Ok(MockPool {
            driver: self.clone(),
            idle: Mutex::new(Vec::new()),
        })
    }
}

pub struct MockPool {
    driver: MockDriver,
    idle: Mutex<Vec<MockConnection>>,
}

#[async_trait]
impl DriverPool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> DriverResult<MockConnection> {
        self.driver.state().acquired += 1;
        let idle = self.idle.lock().unwrap().pop();
        Ok(idle.unwrap_or_else(|| self.driver.open()))
    }

    fn release(&self, conn: MockConnection) {
        self.driver.state().released += 1;
        self.idle.lock().unwrap().push(conn);
    }

    async fn close(&self) {
        if let Some(delay) = self.driver.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.driver.state().pool_closed = true;
    }

    fn terminate(&self) {
        self.driver.state().terminated = true;
    }
}

pub struct MockConnection {
    id: i64,
    state: Arc<Mutex<MockState>>,
    layers: Vec<Vec<String>>,
}

impl MockConnection {
    fn record(&self, sql: &str) -> DriverResult<()> {
        self.state.lock().unwrap().log.push(sql.to_string());
        if sql.contains("FAIL") {
            return Err(format!("mock failure: {}", sql).into());
        }
        Ok(())
    }

    fn write(&mut self, row: String) {
        match self.layers.last_mut() {
            Some(layer) => layer.push(row),
            None => self.state.lock().unwrap().committed.push(row),
        }
    }

    fn visible(&self) -> Vec<String> {
        let mut rows = self.state.lock().unwrap().committed.clone();
        rows.extend(self.layers.iter().flatten().cloned());
        rows
    }
}

fn text(value: &DriverValue) -> String {
    match value {
        DriverValue::Text(s) => s.clone(),
        DriverValue::Int(n) => n.to_string(),
        other => format!("{:?}", other),
    }
}

fn to_value(value: &DriverValue) -> Value {
    match value {
        DriverValue::Null => Value::Null,
        DriverValue::Bool(b) => Value::Bool(*b),
        DriverValue::Int(n) => Value::Int(*n),
        DriverValue::Float(f) => Value::Float(*f),
        DriverValue::Text(s) => Value::Text(s.clone()),
        other => Value::Text(format!("{:?}", other)),
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<u64> {
        self.record(sql)?;
        if sql.starts_with("INSERT") {
            let row = args.first().map(text).unwrap_or_default();
            self.write(row);
            return Ok(1);
        }
        Ok(0)
    }

    async fn execute_many(&mut self, sql: &str, arg_lists: &[Vec<DriverValue>]) -> DriverResult<u64> {
        let mut affected = 0;
        for args in arg_lists {
            affected += self.execute(sql, args).await?;
        }
        Ok(affected)
    }

    async fn fetch_value(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<Value>> {
        self.record(sql)?;
        if sql == CONNECTION_ID {
            return Ok(Some(Value::Int(self.id)));
        }
        if sql.contains("count") {
            return Ok(Some(Value::Int(self.visible().len() as i64)));
        }
        Ok(args.first().map(to_value))
    }

    async fn fetch_row(&mut self, sql: &str, args: &[DriverValue]) -> DriverResult<Option<RawRow>> {
        Ok(self.fetch_all(sql, args).await?.into_iter().next())
    }

    async fn fetch_all(&mut self, sql: &str, _args: &[DriverValue]) -> DriverResult<Vec<RawRow>> {
        self.record(sql)?;
        let columns: Arc<[String]> = vec!["name".to_string()].into();
        Ok(self
            .visible()
            .into_iter()
            .map(|name| RawRow::new(columns.clone(), vec![Value::Text(name)]))
            .collect())
    }

    async fn copy_records_to_table(
        &mut self,
        table: &str,
        records: &[Vec<DriverValue>],
        _columns: Option<&[&str]>,
    ) -> DriverResult<u64> {
        self.record(&format!("COPY {}", table))?;
        for record in records {
            let row = record.first().map(text).unwrap_or_default();
            self.write(row);
        }
        Ok(records.len() as u64)
    }

    async fn begin(&mut self) -> DriverResult<()> {
        self.record(if self.layers.is_empty() { "BEGIN" } else { "SAVEPOINT" })?;
        self.layers.push(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.record(if self.layers.len() > 1 { "RELEASE SAVEPOINT" } else { "COMMIT" })?;
        if let Some(layer) = self.layers.pop() {
            for row in layer {
                self.write(row);
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let delay = self.state.lock().unwrap().rollback_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(if self.layers.len() > 1 { "ROLLBACK TO SAVEPOINT" } else { "ROLLBACK" })?;
        self.layers.pop();
        if self.state.lock().unwrap().fail_rollback {
            return Err("mock rollback failure".into());
        }
        Ok(())
    }

    async fn close(self) -> DriverResult<()> {
        self.state.lock().unwrap().closed_connections += 1;
        Ok(())
    }
}

pub fn pool_db(driver: &MockDriver) -> Database<MockDriver> {
    Database::with_driver(driver.clone(), DatabaseConfig::from_dsn("postgres://mock/test")).unwrap()
}

pub fn force_rollback_db(driver: &MockDriver) -> Database<MockDriver> {
    let config = DatabaseConfig::builder()
        .dsn("postgres://mock/test")
        .force_rollback(true)
        .build()
        .unwrap();
    Database::with_driver(driver.clone(), config).unwrap()
}

pub fn name(value: &str) -> Params {
    Params::new().bind("name", value)
}

/// Let spawned cleanup tasks run.
pub async fn settle_background() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
