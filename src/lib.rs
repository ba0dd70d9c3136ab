pub mod config;
pub mod db;
pub mod handlers;
pub mod model;
pub mod service;
pub mod telegram;
