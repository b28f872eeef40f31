pub mod admin;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod fulfillment;
pub mod har;
pub mod host;
pub mod index;
pub mod interception;
pub mod logging;
pub mod navigation;
pub mod storage;
