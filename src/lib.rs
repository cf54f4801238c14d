pub mod callbacks;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod session;
pub mod ssh;
pub mod transport;
pub mod utils;
pub mod viewer;
pub mod web;
