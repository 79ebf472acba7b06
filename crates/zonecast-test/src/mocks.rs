//! Mock implementations for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zonecast_gateway::{MessageSink, TransportError};

/// Mock implementation of the [`MessageSink`] trait.
///
/// Records every frame sent to it and can be scripted to fail the next
/// N sends, which exercises the connection layer's direct-send fallback
/// and recovery loop. Uses `std::sync::Mutex` internally so assertions
/// work from both sync and async contexts.
#[derive(Debug, Default)]
pub struct MockSink {
    frames: Mutex<Vec<String>>,
    fail_next: AtomicU32,
    closed: Mutex<Option<(u16, String)>>,
}

impl MockSink {
    /// Create a mock sink that accepts every send.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` sends with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every send until [`recover`](Self::recover) is called.
    pub fn fail_all(&self) {
        self.fail_next.store(u32::MAX, Ordering::SeqCst);
    }

    /// Stop failing sends.
    pub fn recover(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
    }

    /// Every frame successfully sent, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Sent frames parsed as JSON.
    #[must_use]
    pub fn json_frames(&self) -> Vec<serde_json::Value> {
        self.frames()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Sent frames whose `type` field matches `frame_type`.
    #[must_use]
    pub fn frames_of_type(&self, frame_type: &str) -> Vec<serde_json::Value> {
        self.json_frames()
            .into_iter()
            .filter(|v| v["type"] == frame_type)
            .collect()
    }

    /// The close code and reason, if the sink was closed.
    #[must_use]
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.closed.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Wait until `check` passes over the sent frames, panicking after
    /// three seconds.
    ///
    /// # Panics
    ///
    /// Panics when the condition is not reached in time.
    pub async fn wait_until<F>(&self, mut check: F)
    where
        F: FnMut(&[String]) -> bool,
    {
        let deadline = Duration::from_secs(3);
        let result = tokio::time::timeout(deadline, async {
            loop {
                if check(&self.frames()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "mock sink condition not reached in time");
    }

    /// Wait until at least `n` frames were sent.
    ///
    /// # Panics
    ///
    /// Panics when fewer than `n` frames arrive in time.
    pub async fn wait_for_frames(&self, n: usize) {
        self.wait_until(|frames| frames.len() >= n).await;
    }
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_next
                    .store(remaining.saturating_sub(1), Ordering::SeqCst);
            }
            return Err(TransportError::Closed(1006));
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(text.to_string());
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = Some((code, reason.to_string()));
        }
        Ok(())
    }
}
