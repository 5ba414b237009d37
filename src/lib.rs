pub mod config;
pub mod db;
pub mod enrich;
pub mod model;
pub mod pipeline;
pub mod quota;
pub mod reconcile;
pub mod takeout;
pub mod youtube;
