pub mod event;
pub mod job;
pub mod protocol;
pub mod schedule;
pub mod store;
