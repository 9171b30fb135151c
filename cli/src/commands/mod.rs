pub mod analytics;
pub mod health;
pub mod session;
pub mod workout;
