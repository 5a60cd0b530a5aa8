//! Image generation queue
//!
//! A single-flight scheduler for text-to-image jobs: it admits requests
//! against a credit balance, runs them one at a time against hosted inference
//! endpoints with rotating API credentials and status-aware retries, stores
//! the images, and keeps its job list in a durable key-value store so queued
//! work survives restarts.

pub mod app_state;
pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
