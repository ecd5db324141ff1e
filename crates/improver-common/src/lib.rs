pub mod assistant;
pub mod error;
pub mod ids;
pub mod redis;
pub mod run;
