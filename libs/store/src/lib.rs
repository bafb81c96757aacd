pub mod model;
pub mod repo;

/// Embedded schema migrations; the binary runs them once at startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
