pub mod provider;

pub use provider::{EventBreakdown, TimeWindow, UmamiProvider};
