//! Crisp Interview Assistant
//!
//! Application state persistence. See the [`storage`] crate for the
//! persistence manager, backends, transforms and migrations, and
//! [`storage::app_state`] for the interview application's schema.

pub use storage;
pub use storage::app_state;
