//! drivelite: private, versioned file storage served over a framed TCP
//! protocol with per-file sharing.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod network;
pub mod notify;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod service;
pub mod storage;
pub mod transfer;
pub mod validation;
