pub mod platform;
pub mod prior;
