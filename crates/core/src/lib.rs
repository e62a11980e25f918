//! Core crate for the capvid video captioning service.

pub mod burn_in;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod subtitles;
pub mod transcription;
pub mod workdir;
