//! Integration test suite.

mod mock_exchange;
mod pipeline;
