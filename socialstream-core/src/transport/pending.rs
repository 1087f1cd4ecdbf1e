//! Outbound frames buffered while the channel is down

use std::collections::VecDeque;

use tracing::debug;

/// A SEND waiting for the next connection
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    /// Client-generated id; the only dedup key the queue honours
    pub id: u64,
    pub destination: String,
    pub body: String,
}

/// FIFO of frames published while disconnected.
///
/// Each frame is handed out exactly once by [`PendingQueue::drain`]; a frame
/// that fails to send after being drained is the caller's to re-queue.
#[derive(Debug, Default)]
pub struct PendingQueue {
    frames: VecDeque<PendingFrame>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame, returning its id
    pub fn push(&mut self, destination: &str, body: String) -> u64 {
        let id = rand::random::<u64>();
        self.push_frame(PendingFrame {
            id,
            destination: destination.to_string(),
            body,
        });
        id
    }

    /// Queue an already-identified frame; a repeated id is ignored
    pub fn push_frame(&mut self, frame: PendingFrame) {
        if self.frames.iter().any(|f| f.id == frame.id) {
            debug!("Pending frame {} already queued", frame.id);
            return;
        }
        debug!("Queued frame for {} ({} pending)", frame.destination, self.frames.len() + 1);
        self.frames.push_back(frame);
    }

    /// Put frames back at the head, ahead of anything queued since
    pub fn requeue_front(&mut self, frames: Vec<PendingFrame>) {
        for frame in frames.into_iter().rev() {
            if !self.frames.iter().any(|f| f.id == frame.id) {
                self.frames.push_front(frame);
            }
        }
    }

    /// Take every queued frame, oldest first
    pub fn drain(&mut self) -> Vec<PendingFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_drain() {
        let mut queue = PendingQueue::new();
        queue.push("/app/a", "1".to_string());
        queue.push("/app/b", "2".to_string());
        queue.push("/app/a", "3".to_string());

        let drained = queue.drain();
        let bodies: Vec<&str> = drained.iter().map(|f| f.body.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
        assert!(queue.is_empty());

        // Drained frames are gone for good
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_duplicate_id_ignored() {
        let mut queue = PendingQueue::new();
        let frame = PendingFrame {
            id: 9,
            destination: "/app/x".to_string(),
            body: "{}".to_string(),
        };
        queue.push_frame(frame.clone());
        queue.push_frame(frame);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = PendingQueue::new();
        queue.push("/app/a", "1".to_string());
        queue.push("/app/a", "2".to_string());
        let first = queue.drain();

        queue.push("/app/a", "3".to_string());
        queue.requeue_front(first);

        let bodies: Vec<String> = queue.drain().into_iter().map(|f| f.body).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
    }
}
