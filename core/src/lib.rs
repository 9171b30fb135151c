pub mod aggregates;
pub mod error;
pub mod extraction;
pub mod records;
pub mod workouts;
