// lib.rs
pub mod analysis;
pub mod annotations;
pub mod assemble;
pub mod commands;
pub mod error;
pub mod faidx;
pub mod melt;
pub mod oracle;
pub mod repeats;
pub mod targets;
pub mod window;
