//! Buffer for locally discovered ICE candidates
//!
//! Candidates discovered before the remote description is known must not be
//! sent; they wait here and are drained exactly once, in discovery order,
//! after the remote description is applied.

use tokio::sync::Mutex;

use crate::signaling::IceCandidate;

/// Append-only candidate buffer with a one-shot flush.
///
/// Appended to by the engine's candidate callback and drained by the
/// handshake path, which may run on a different task. A single mutex
/// serializes the two; it is held only for the append or the drain itself,
/// never across a send.
#[derive(Default)]
pub struct PendingCandidates {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    buffered: Vec<IceCandidate>,
    flushed: bool,
}

impl PendingCandidates {
    /// Buffer a candidate, or hand it back when the buffer was already
    /// flushed and the candidate should be sent directly.
    pub async fn push(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut inner = self.inner.lock().await;
        if inner.flushed {
            return Some(candidate);
        }
        inner.buffered.push(candidate);
        None
    }

    /// Drain every buffered candidate in discovery order and mark the
    /// buffer flushed, atomically under the same lock. Second and later
    /// calls return nothing.
    pub async fn flush(&self) -> Vec<IceCandidate> {
        let mut inner = self.inner.lock().await;
        inner.flushed = true;
        std::mem::take(&mut inner.buffered)
    }

    /// Number of candidates currently buffered
    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buffered.len()
    }
}
