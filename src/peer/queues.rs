use std::{
    collections::HashSet,
    sync::Mutex,
};
use tokio::sync::Notify;
use crate::data::{FileId, FilePieceSpecSet, PieceSpec, PieceSpecSet};
use super::Notice;

/// Outbound notice queue. Additions coalesce into a piece-spec set and
/// removals into a file-id set; `take` alternates between the two when
/// both are pending so neither starves.
#[derive(Default)]
pub struct NoticeQueue {
    state: Mutex<NoticeState>,
    notify: Notify,
}

#[derive(Default)]
struct NoticeState {
    additions: PieceSpecSet,
    removals: HashSet<FileId>,
    removal_next: bool,
}

impl NoticeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_addition(&self, set: FilePieceSpecSet) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.additions.merge_file(set);
        drop(state);
        self.notify.notify_one();
    }

    pub fn push_removals(&self, ids: impl IntoIterator<Item = FileId>) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let before = state.removals.len();
        state.removals.extend(ids);
        let grew = state.removals.len() > before;
        drop(state);
        if grew {
            self.notify.notify_one();
        }
    }

    pub async fn take(&self) -> Notice {
        loop {
            let notified = self.notify.notified();
            if let Some(notice) = self.try_take() {
                // Leftovers mean another take must run.
                self.notify.notify_one();
                return notice;
            }
            notified.await;
        }
    }

    fn try_take(&self) -> Option<Notice> {
        let mut state = self.state.lock().ok()?;
        let take_removal = !state.removals.is_empty()
            && (state.removal_next || state.additions.is_empty());

        if take_removal {
            state.removal_next = false;
            let mut ids: Vec<FileId> = state.removals.drain().collect();
            return Some(if ids.len() == 1 {
                Notice::RemovedFile(ids.pop().expect("one element"))
            } else {
                Notice::RemovedFiles(ids)
            });
        }

        if let Some(file) = state.additions.pop_file() {
            state.removal_next = true;
            return Some(Notice::Addition(file));
        }
        None
    }
}

/// Outbound request queue: a single merging piece-spec set. `take`
/// waits until the set is non-empty and drains it whole.
#[derive(Default)]
pub struct RequestQueue {
    state: Mutex<PieceSpecSet>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&self, set: PieceSpecSet) {
        if set.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.merge(set);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn merge_spec(&self, spec: PieceSpec) {
        if let Ok(mut state) = self.state.lock() {
            state.merge_spec(spec);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn take(&self) -> PieceSpecSet {
        loop {
            let notified = self.notify.notified();
            if let Some(set) = self.try_take() {
                return set;
            }
            notified.await;
        }
    }

    fn try_take(&self) -> Option<PieceSpecSet> {
        let mut state = self.state.lock().ok()?;
        if !state.is_empty() {
            Some(state.take())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ArchivePath, ArchiveTime, FileInfo};

    fn info(name: &str) -> FileInfo {
        FileInfo::new(
            FileId::new(
                ArchivePath::parse(name).unwrap(),
                ArchiveTime::from_micros(3),
            ),
            64,
            8,
            3600,
        )
    }

    #[tokio::test]
    async fn test_notice_queue_alternates() {
        let queue = NoticeQueue::new();
        queue.push_addition(FilePieceSpecSet::whole(info("a")));
        queue.push_addition(FilePieceSpecSet::whole(info("b")));
        queue.push_removals([info("gone").id]);

        let first = queue.take().await;
        let second = queue.take().await;
        let third = queue.take().await;

        // One removal sandwiched between the two additions.
        assert!(matches!(first, Notice::Addition(_)));
        assert!(matches!(second, Notice::RemovedFile(_)));
        assert!(matches!(third, Notice::Addition(_)));
    }

    #[tokio::test]
    async fn test_notice_queue_coalesces_additions() {
        let queue = NoticeQueue::new();
        queue.push_addition(FilePieceSpecSet::single(info("a"), 0));
        queue.push_addition(FilePieceSpecSet::single(info("a"), 1));

        match queue.take().await {
            Notice::Addition(set) => assert_eq!(set.iter_specs().count(), 2),
            other => panic!("unexpected notice: {}", other),
        }
    }

    #[tokio::test]
    async fn test_notice_queue_take_blocks_until_pushed() {
        let queue = std::sync::Arc::new(NoticeQueue::new());
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!taker.is_finished());
        queue.push_removals([info("x").id]);
        assert!(matches!(taker.await.unwrap(), Notice::RemovedFile(_)));
    }

    #[tokio::test]
    async fn test_request_queue_merges_and_drains() {
        let queue = RequestQueue::new();
        queue.merge_spec(crate::data::PieceSpec::new(info("a"), 0).unwrap());
        queue.merge_spec(crate::data::PieceSpec::new(info("a"), 3).unwrap());

        let drained = queue.take().await;
        assert_eq!(drained.iter_specs().count(), 2);

        queue.merge_spec(crate::data::PieceSpec::new(info("b"), 1).unwrap());
        let next = queue.take().await;
        assert_eq!(next.iter_specs().count(), 1);
    }
}
