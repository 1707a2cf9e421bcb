//! Newsdesk - a news feed query, ranking and pagination service
//!
//! Articles are filtered by category, tags and full-text search, ordered
//! either newest first or by a time-decayed vote score, and returned as
//! `next`/`prev` windows around an anchor article or as fixed-size pages.

pub mod auth;
pub mod config;
pub mod db;
pub mod feed;
pub mod pagination;
pub mod projection;
pub mod query;
pub mod routes;
pub mod trending;
