//! Waiting queue of searching users

pub mod waiting;

pub use waiting::WaitingQueue;
