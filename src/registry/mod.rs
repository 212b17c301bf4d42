//! Registry access: the trait consumed by the scheduler core and the
//! Postgres implementation used in production.

pub mod client;
pub mod postgres;

pub use client::JobRegistry;
pub use postgres::PgJobRegistry;
