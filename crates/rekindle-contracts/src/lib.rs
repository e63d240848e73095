pub mod costs;
pub mod errors;
pub mod events;
pub mod history;
pub mod images;
pub mod photos;
pub mod scenarios;
pub mod session;
