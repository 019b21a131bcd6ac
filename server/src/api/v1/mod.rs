pub mod auth;
pub mod package;
pub mod token;
pub mod track;
pub mod user;
