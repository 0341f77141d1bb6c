use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::{AccountCredential, AccountStore, Address, Card, Product, StoreError};

const ACCOUNT_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS accounts (
        account_id INTEGER PRIMARY KEY,
        label TEXT,
        session TEXT NOT NULL,
        last_known_points REAL
    );

    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        price REAL
    );

    CREATE TABLE IF NOT EXISTS addresses (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
"#;

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// SQLite-backed account, catalog and address data.
///
/// The `upsert_*` helpers exist for seeding and tests; the records are owned
/// by whatever manages accounts outside the engine.
pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
}

impl SqliteAccountStore {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(ACCOUNT_SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(format!("connection lock poisoned: {}", e)))
    }

    pub fn upsert_credential(&self, credential: &AccountCredential) -> Result<(), StoreError> {
        let session = serde_json::to_string(&credential.session).map_err(ser_err)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO accounts (account_id, label, session, last_known_points)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    credential.account_id as i64,
                    credential.label,
                    session,
                    credential.last_known_points,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_product(&self, product: &Product) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO products (id, name, url, price) VALUES (?1, ?2, ?3, ?4)",
                params![product.id, product.name, product.url, product.price],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_address(&self, address: &Address) -> Result<(), StoreError> {
        let data = serde_json::to_string(address).map_err(ser_err)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO addresses (id, data) VALUES (?1, ?2)",
                params![address.id, data],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_card(&self, card: &Card) -> Result<(), StoreError> {
        let data = serde_json::to_string(card).map_err(ser_err)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO cards (id, data) VALUES (?1, ?2)",
                params![card.id, data],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let data: Option<String> = self
            .conn()?
            .query_row(sql, params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;

        data.map(|json| serde_json::from_str(&json).map_err(ser_err))
            .transpose()
    }
}

impl AccountStore for SqliteAccountStore {
    fn load_credential(&self, account_id: u64) -> Result<Option<AccountCredential>, StoreError> {
        let row: Option<(Option<String>, String, Option<f64>)> = self
            .conn()?
            .query_row(
                "SELECT label, session, last_known_points FROM accounts WHERE account_id = ?1",
                params![account_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;

        row.map(
            |(label, session, last_known_points)| -> Result<AccountCredential, StoreError> {
                Ok(AccountCredential {
                    account_id,
                    label,
                    session: serde_json::from_str(&session).map_err(ser_err)?,
                    last_known_points,
                })
            },
        )
        .transpose()
    }

    fn load_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT id, name, url, price FROM products WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Product {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        url: row.get(2)?,
                        price: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    fn load_address(&self, id: &str) -> Result<Option<Address>, StoreError> {
        self.load_json("SELECT data FROM addresses WHERE id = ?1", id)
    }

    fn load_card(&self, id: &str) -> Result<Option<Card>, StoreError> {
        self.load_json("SELECT data FROM cards WHERE id = ?1", id)
    }
}
