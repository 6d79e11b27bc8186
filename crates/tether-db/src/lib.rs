//! Storage for reattach records when the supervisor runs against a database
//! instead of the JSON file.

pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

/// Opens the reattach database. Per-statement logging is off; the record is written on
/// every lifecycle change and would drown the agent's own log.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut options = ConnectOptions::new(database_url.to_owned());
    options.sqlx_logging(false);
    Database::connect(options).await
}
