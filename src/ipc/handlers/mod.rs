pub mod bulletins;
pub mod classes;
pub mod core;
pub mod exchange;
pub mod grades;
pub mod reports;
pub mod setup;
pub mod students;
pub mod years;
