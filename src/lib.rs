//! SightAssist - assistive vision for signs and walkway damage
//!
//! Freezes a frame, detects signs or surface damage in it, reads the text
//! inside each detected region and speaks the results.
//!
//! [`app::AssistApp`] runs the whole pipeline; the modules below can also be
//! wired by hand around a custom camera, overlay or speech engine.

pub mod app;
pub mod capture;
pub mod config;
pub mod export;
pub mod geometry;
pub mod mode;
pub mod overlay;
pub mod pipeline;
pub mod shared;
pub mod speech;
pub mod storage;
pub mod vision;
