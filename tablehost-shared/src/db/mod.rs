//! Database layer for Tablehost
//!
//! - `pool`: PostgreSQL connection pool with a startup health check
//! - `migrations`: embedded schema migrations (`tablehost-shared/migrations`)
//!
//! Queries live next to their models in `crate::models`; the engine reaches
//! them through `crate::store::PgStore`.
//!
//! # Example
//!
//! ```no_run
//! use tablehost_shared::db::pool::{create_pool, DatabaseConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DatabaseConfig {
//!         url: std::env::var("DATABASE_URL")?,
//!         ..Default::default()
//!     };
//!
//!     let pool = create_pool(config).await?;
//!     tablehost_shared::db::migrations::run_migrations(&pool).await?;
//!     Ok(())
//! }
//! ```

pub mod migrations;
pub mod pool;
