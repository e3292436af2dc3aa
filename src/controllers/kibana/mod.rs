pub mod controller;
mod driver;
pub mod reconcilers;

pub use controller::{run, Context};
