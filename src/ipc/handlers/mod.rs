pub mod accounts;
pub mod allotments;
pub mod core;
pub mod generate;
pub mod groups;
pub mod links;
pub mod setup;
pub mod timetables;
