//! Radio play catalog - artist identity resolution, play dedup and library matching.

pub mod catalog;
pub mod collab;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod models;
pub mod musicbrainz;
pub mod normalize;
pub mod overrides;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod scoring;
