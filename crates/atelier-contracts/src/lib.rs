pub mod catalog;
pub mod events;
pub mod history;
pub mod records;
