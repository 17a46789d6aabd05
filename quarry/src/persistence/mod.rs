/// PostgreSQL implementation of the back-end port.
///
/// This module provides [`PostgresDelegate`], a sqlx-backed implementation
/// of the [`Delegate`](crate::delegate::Delegate) trait with row-lock based
/// mutual exclusion for clustered deployments.
pub mod postgres;

pub use postgres::PostgresDelegate;
