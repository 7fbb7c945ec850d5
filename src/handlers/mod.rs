pub mod deposits;
pub mod health;
pub mod reviews;
pub mod trades;
pub mod users;
