pub mod files;
pub mod jobs;
pub mod ports;
pub mod rules;
pub mod servers;
