//! the test_utils folder here will share fixtures and fake components
//! between unit tests and integration tests
mod builders;
mod fake_backend;

pub use builders::*;
pub use fake_backend::*;
