pub mod api;
pub mod booking;
pub mod clock;
pub mod config;
pub mod dates;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod observability;
pub mod ratelimit;
pub mod reaper;
pub mod wal;
