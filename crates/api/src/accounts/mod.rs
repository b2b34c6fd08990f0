//! Tenant data model

mod models;

pub use models::{Account, Session, User};
