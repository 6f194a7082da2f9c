pub mod batch;
pub mod events;
pub mod history;
pub mod notify;
