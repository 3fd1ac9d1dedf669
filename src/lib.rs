pub mod aggregate;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod stage;
pub mod state;
pub mod store;
pub mod ui;
pub mod worker;
