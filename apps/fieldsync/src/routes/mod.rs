//! Route modules for FieldSync Server

pub mod health;
pub mod sync;
