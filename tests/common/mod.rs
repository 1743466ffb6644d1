#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Ordered record of destructor firings, cloneable into destructor
/// closures.
#[derive(Clone, Default)]
pub struct CleanupLog(Arc<Mutex<Vec<String>>>);

impl CleanupLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a destructor closure that records `tag` when it fires.
    pub fn destructor(&self, tag: &str) -> impl FnOnce(u32) + Send + 'static {
        let log = Arc::clone(&self.0);
        let tag = tag.to_owned();
        move |_| log.lock().push(tag)
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// How many times a destructor with `tag` has fired.
    #[must_use]
    pub fn count(&self, tag: &str) -> usize {
        self.0.lock().iter().filter(|entry| *entry == tag).count()
    }
}
