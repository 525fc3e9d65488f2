pub mod catalog;
pub mod configs;
pub mod core;
pub mod grades;
pub mod reports;
pub mod roster;
pub mod roster_import;
