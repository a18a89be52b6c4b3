pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod middleware;
pub mod routes;
pub mod services;
