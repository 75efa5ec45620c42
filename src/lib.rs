pub mod config;
pub mod digest;
pub mod humanize;
pub mod observability;
pub mod pdf;
pub mod repair;
pub mod signing;
pub mod tsa;
pub mod worker;
