#![forbid(unsafe_code)]

//! Job-tracking service that downloads YouTube videos for the shorts
//! pipeline. The `backend` binary serves [`api::router`]; `generate_secrets`
//! prepares the `.env` secrets it needs.

pub mod api;
pub mod config;
pub mod downloads;
pub mod jobs;
pub mod middleware;
pub mod security;
pub mod store;
pub mod youtube;
