pub mod config;
pub mod display;
pub mod engine;
pub mod form;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tz;
pub mod wal;
pub mod wire;
