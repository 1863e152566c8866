pub mod pool;
pub mod queries;
pub mod queries_review;

pub use pool::{create_pool, migrate};
pub use queries::*;
pub use queries_review::*;
