mod rollback_tests;

pub use test_utils::*;
