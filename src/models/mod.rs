pub mod auth;
pub mod chat;
pub mod skin_check;
