pub mod app;
pub mod config;
pub mod db;
pub mod flight;
pub mod handlers;
pub mod loyalty;
pub mod model;
pub mod orchestrator;
pub mod phone;
pub mod secrets;
pub mod template;
pub mod whatsapp;
