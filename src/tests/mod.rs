mod engine_tests;
mod store_tests;
