// src/lib.rs

//! Auction listing harvester library

pub mod error;
pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
