//! Vote-ordered room queue

use std::collections::HashMap;

use tracing::debug;

use super::SyncError;
use crate::api::{QueueItem, UserRef, Video};

/// One queued video
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub video: Video,
    pub added_by: Option<UserRef>,
    pub vote_count: u32,
    pub viewer_has_voted: bool,
    /// Insertion order, used to break vote ties
    seq: u64,
}

/// Entries sorted by votes (descending), ties by insertion order
#[derive(Debug, Clone, Default)]
pub struct RoomQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl RoomQueue {
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn get(&self, id: i64) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace with a server list.
    ///
    /// Known entries keep their insertion order and, when the server does not
    /// say, the viewer's vote flag. New entries are appended in list order.
    pub fn replace(&mut self, items: Vec<QueueItem>) {
        let previous: HashMap<i64, (u64, bool)> = self
            .entries
            .iter()
            .map(|e| (e.id, (e.seq, e.viewer_has_voted)))
            .collect();

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let (seq, voted) = match previous.get(&item.id) {
                Some(&(seq, voted)) => (seq, voted),
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    (seq, false)
                }
            };
            entries.push(QueueEntry {
                id: item.id,
                video: item.video,
                added_by: item.added_by,
                vote_count: item.total_votes,
                viewer_has_voted: item.has_voted.unwrap_or(voted),
                seq,
            });
        }

        self.entries = entries;
        self.sort();
        debug!("Queue replaced ({} entries)", self.entries.len());
    }

    /// Add (or refresh) a single entry
    pub fn add(&mut self, item: QueueItem) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == item.id) {
            existing.video = item.video;
            existing.vote_count = item.total_votes;
            if let Some(voted) = item.has_voted {
                existing.viewer_has_voted = voted;
            }
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.push(QueueEntry {
                id: item.id,
                video: item.video,
                added_by: item.added_by,
                vote_count: item.total_votes,
                viewer_has_voted: item.has_voted.unwrap_or(false),
                seq,
            });
        }
        self.sort();
    }

    pub fn remove(&mut self, id: i64) -> Option<QueueEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// Toggle the viewer's vote. Returns whether the viewer now has a vote in.
    pub fn toggle_vote(&mut self, id: i64) -> Result<bool, SyncError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(SyncError::UnknownQueueEntry(id))?;

        if entry.viewer_has_voted {
            entry.vote_count = entry.vote_count.saturating_sub(1);
            entry.viewer_has_voted = false;
        } else {
            entry.vote_count += 1;
            entry.viewer_has_voted = true;
        }
        let voted = entry.viewer_has_voted;

        self.sort();
        Ok(voted)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.vote_count.cmp(&a.vote_count).then(a.seq.cmp(&b.seq)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, votes: u32) -> QueueItem {
        QueueItem {
            id,
            video: Video {
                id: id * 10,
                title: String::new(),
                media_url: None,
                thumbnail_url: None,
            },
            position: None,
            added_by: None,
            total_votes: votes,
            has_voted: None,
        }
    }

    fn ids(queue: &RoomQueue) -> Vec<i64> {
        queue.entries().iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_order_by_votes_then_insertion() {
        let mut queue = RoomQueue::default();
        queue.replace(vec![item(1, 0), item(2, 3), item(3, 0), item(4, 3)]);
        assert_eq!(ids(&queue), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_toggle_vote_twice_restores() {
        let mut queue = RoomQueue::default();
        queue.replace(vec![item(1, 2), item(2, 2)]);

        assert_eq!(queue.toggle_vote(2), Ok(true));
        assert_eq!(queue.get(2).unwrap().vote_count, 3);
        assert_eq!(ids(&queue), vec![2, 1]);

        assert_eq!(queue.toggle_vote(2), Ok(false));
        let entry = queue.get(2).unwrap();
        assert_eq!(entry.vote_count, 2);
        assert!(!entry.viewer_has_voted);
        // Tie again: insertion order wins
        assert_eq!(ids(&queue), vec![1, 2]);
    }

    #[test]
    fn test_toggle_unknown_entry() {
        let mut queue = RoomQueue::default();
        assert_eq!(queue.toggle_vote(5), Err(SyncError::UnknownQueueEntry(5)));
    }

    #[test]
    fn test_vote_flag_survives_replace() {
        let mut queue = RoomQueue::default();
        queue.replace(vec![item(1, 0)]);
        queue.toggle_vote(1).unwrap();

        // Server confirms the count but does not say who voted
        queue.replace(vec![item(1, 1), item(2, 0)]);
        assert!(queue.get(1).unwrap().viewer_has_voted);
        assert!(!queue.get(2).unwrap().viewer_has_voted);

        // Explicit flag from the server wins
        let mut confirmed = item(1, 1);
        confirmed.has_voted = Some(false);
        queue.replace(vec![confirmed]);
        assert!(!queue.get(1).unwrap().viewer_has_voted);
    }

    #[test]
    fn test_add_and_remove() {
        let mut queue = RoomQueue::default();
        queue.add(item(1, 0));
        queue.add(item(2, 1));
        assert_eq!(ids(&queue), vec![2, 1]);

        assert_eq!(queue.remove(2).map(|e| e.id), Some(2));
        assert_eq!(queue.remove(2), None);
        assert_eq!(ids(&queue), vec![1]);
    }
}
