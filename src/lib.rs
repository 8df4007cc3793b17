// Memoria session core - library root

pub mod auth;
pub mod back_path;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod location;
pub mod logout;
pub mod session;
pub mod storage;
pub mod surface;
