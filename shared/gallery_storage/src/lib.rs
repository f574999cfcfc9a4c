//! Durable storage for the image gallery
//!
//! This crate owns the `images` table: the authoritative like counts, the
//! metadata rows written by ingestion and the paged queries used by listing.

pub mod images;
