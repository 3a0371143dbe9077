pub mod api;
pub mod bus;
pub mod consumer;
pub mod error;
pub mod expiry;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod outbox;
pub mod schema;
pub mod service;
pub mod store;
pub mod strategy;
