pub mod chat;
pub mod events;
pub mod gallery;
pub mod models;
