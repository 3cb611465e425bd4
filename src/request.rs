//! Index requests: the unit of work flowing through the zone pipeline.
//!
//! A request enters at the session, is routed to the zone owning its name,
//! executes on that zone's worker thread, and finishes on the callback
//! thread. A request that misses the page cache is parked with the read
//! pool and re-enqueued (`requeued`) when its page becomes resident.
//! Control messages ride the same queues as user requests so that they are
//! ordered with respect to them.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::name::{ChunkData, ChunkName, METADATA_SIZE};

/// The operation a request performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Index the name, or return the existing binding if present.
    Post,
    /// Rebind the name unconditionally.
    Update,
    /// Look the name up; `update` also refreshes it in the open chapter.
    Query { update: bool },
    /// Remove the binding.
    Delete,
}

/// The general location of a name in the index, reported to the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// The location has not been determined yet.
    Unknown,
    /// The name is not in the index.
    Unavailable,
    /// The name is in the open chapter of its zone.
    InOpenChapter,
    /// The name is in a densely indexed chapter.
    InDense,
    /// The name is in a sparsely indexed chapter.
    InSparse,
}

/// Inter-zone control messages, delivered through the zone queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneMessage {
    /// Admit a chapter to the sparse cache before later requests observe
    /// a non-cached state.
    SparseCacheBarrier { virtual_chapter: u64 },
    /// Another zone closed this chapter; close it here too if still open,
    /// to bound zone skew.
    AnnounceChapterClosed { virtual_chapter: u64 },
}

/// The completion callback. Runs on the callback worker thread.
pub type Callback = Box<dyn FnOnce(&Request) + Send>;

/// A request traveling the index pipeline.
pub struct Request {
    pub name: ChunkName,
    pub kind: RequestKind,
    /// The metadata to bind on POST/UPDATE.
    pub new_metadata: ChunkData,
    /// The metadata found by the search, valid when `found`.
    pub old_metadata: ChunkData,
    pub found: bool,
    pub location: Location,
    pub status: Result<()>,
    /// The zone owning this request's name.
    pub zone: u32,
    /// The request was re-enqueued after a page-cache miss.
    pub requeued: bool,
    /// Control payload; a message request carries no user operation.
    pub message: Option<ZoneMessage>,
    pub callback: Option<Callback>,
}

impl Request {
    pub fn new(name: ChunkName, kind: RequestKind, new_metadata: ChunkData) -> Box<Self> {
        Box::new(Request {
            name,
            kind,
            new_metadata,
            old_metadata: [0u8; METADATA_SIZE],
            found: false,
            location: Location::Unknown,
            status: Ok(()),
            zone: 0,
            requeued: false,
            message: None,
            callback: None,
        })
    }

    pub fn message(zone: u32, message: ZoneMessage) -> Box<Self> {
        let mut request = Request::new(
            ChunkName::new([0u8; 16]),
            RequestKind::Query { update: false },
            [0u8; METADATA_SIZE],
        );
        request.zone = zone;
        request.message = Some(message);
        request
    }

    /// Deliver the completion callback, consuming it.
    pub fn complete(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("zone", &self.zone)
            .field("location", &self.location)
            .field("found", &self.found)
            .field("requeued", &self.requeued)
            .field("message", &self.message)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_request_shape() {
        let request = Request::message(3, ZoneMessage::SparseCacheBarrier { virtual_chapter: 9 });
        assert_eq!(request.zone, 3);
        assert_eq!(
            request.message,
            Some(ZoneMessage::SparseCacheBarrier { virtual_chapter: 9 })
        );
    }

    #[test]
    fn test_complete_consumes_callback() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let observed = calls.clone();
        let mut request = Request::new(
            ChunkName::new([1u8; 16]),
            RequestKind::Post,
            [2u8; METADATA_SIZE],
        );
        request.callback = Some(Box::new(move |r| {
            assert_eq!(r.name, ChunkName::new([1u8; 16]));
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        request.complete();
        request.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
