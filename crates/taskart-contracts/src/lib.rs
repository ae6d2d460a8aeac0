pub mod cache;
pub mod errors;
pub mod events;
pub mod keys;
pub mod payload;
pub mod records;
pub mod request;
