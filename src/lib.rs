//! EnvKit backend: users, projects, environment variables and the CLI
//! device-pairing flow, served over a JSON HTTP API.

pub mod bridge;
pub mod entities;
pub mod errors;
pub mod settings;
pub mod storage;
pub mod web;
