pub mod error;
pub mod math;

pub use error::{Result, StoreError};
pub use math::next_prime;
