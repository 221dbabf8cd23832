//! MySQL monitoring agent core.
//!
//! Long-running subsystems (log relay, data spool, query analytics, instance
//! repository) sit behind [`service::Manager`] and are driven by commands
//! arriving on a websocket control link, dispatched by [`agent::Agent`].

pub mod agent;
pub mod backoff;
pub mod basedir;
pub mod client;
pub mod config;
pub mod context;
pub mod health;
pub mod instance;
pub mod logrelay;
pub mod mrms;
pub mod mysql;
pub mod pid;
pub mod proto;
pub mod qan;
pub mod service;
pub mod spool;
pub mod status;
pub mod ticker;
pub mod version;
