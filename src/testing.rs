//! Testing helpers and mock utilities.
//!
//! Provides convenient constructors for mocked model and storage providers.

use crate::llm::{LlmError, MockGenerativeModel};
use crate::storage::MockUserStore;

/// Create a mock model that answers every text prompt with `reply`.
///
/// Image analysis returns an error unless the test sets its own expectation.
#[must_use]
pub fn mock_model_replying(reply: &'static str) -> MockGenerativeModel {
    let mut mock = MockGenerativeModel::new();
    mock.expect_generate_text()
        .returning(move |_| Ok(reply.to_string()));
    mock.expect_analyze_image()
        .returning(|_, _, _| Err(LlmError::Unknown("Not implemented".to_string())));
    mock
}

/// Create a model mock that fails the test if it is ever called.
#[must_use]
pub fn mock_model_untouched() -> MockGenerativeModel {
    let mut mock = MockGenerativeModel::new();
    mock.expect_generate_text().never();
    mock.expect_analyze_image().never();
    mock
}

/// Create a store whose gate answers `registered` and whose writes succeed.
///
/// Only the calls made by the chat flows are set up:
/// - `is_registered` returns `registered`
/// - `touch_interaction` / `save_chat_exchange` / `save_image_analysis` return `Ok(())`
#[must_use]
pub fn mock_store_gate(registered: bool) -> MockUserStore {
    let mut mock = MockUserStore::new();
    mock.expect_is_registered()
        .returning(move |_| Ok(registered));
    mock.expect_touch_interaction().returning(|_| Ok(()));
    mock.expect_save_chat_exchange().returning(|_| Ok(()));
    mock.expect_save_image_analysis().returning(|_| Ok(()));
    mock
}
