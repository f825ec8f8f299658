pub mod dto;
pub mod handlers;
pub mod models;
pub mod service;
pub mod submission;

pub use service::JobService;
