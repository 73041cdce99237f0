// src/lib.rs

pub mod app_state;
pub mod config;
pub mod error;
pub mod model;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod support;
