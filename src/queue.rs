//! Request queues: a lock-free multi-producer single-consumer funnel with
//! a condition-variable front for sleeping consumers.
//!
//! The funnel queue accepts entries from any number of producer threads
//! and delivers them to exactly one consumer. Producers atomically
//! exchange the tail pointer and then link the previous tail to the new
//! node. Between those two steps a pre-empted producer briefly hides any
//! later entries from the consumer, so emptiness reports are *weak*: a
//! `None` from `poll` means "nothing retrievable right now", not "nothing
//! enqueued". This is a progress property, not a correctness one — the
//! hidden entries reappear as soon as the producer finishes its store.
//!
//! [`RequestQueue`] layers two funnels (a retry lane that re-admitted
//! requests jump, and the main lane) plus a condvar so the consumer can
//! sleep. The consumer uses a bounded timed wait, so a wakeup lost to the
//! producers' weak-progress window only delays delivery briefly.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::request::Request;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

/// A multi-producer single-consumer funnel queue.
///
/// `put` may be called from any thread; `poll` and `is_idle` must only be
/// called from the single consumer thread.
pub struct FunnelQueue<T> {
    /// The producers' end: atomically exchanged, never null.
    newest: AtomicPtr<Node<T>>,
    /// The consumer's end: owned by the consumer, never null.
    oldest: UnsafeCell<*mut Node<T>>,
    /// A permanently allocated stub keeping the ends non-null.
    stub: *mut Node<T>,
}

unsafe impl<T: Send> Send for FunnelQueue<T> {}
unsafe impl<T: Send> Sync for FunnelQueue<T> {}

impl<T> FunnelQueue<T> {
    pub fn new() -> Self {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }));
        FunnelQueue {
            newest: AtomicPtr::new(stub),
            oldest: UnsafeCell::new(stub),
            stub,
        }
    }

    fn put_node(&self, node: *mut Node<T>) {
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        // Swinging the tail first makes the queue momentarily appear empty
        // to the consumer until the link store below completes.
        let prev = self.newest.swap(node, Ordering::AcqRel);
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Enqueue a value. Never blocks.
    pub fn put(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        }));
        self.put_node(node);
    }

    /// Find the oldest retrievable node, re-enqueueing the stub as needed.
    /// Consumer-side only.
    fn get_oldest(&self) -> Option<*mut Node<T>> {
        unsafe {
            let mut oldest = *self.oldest.get();
            let mut next = (*oldest).next.load(Ordering::Acquire);

            if oldest == self.stub {
                // The stub with no successor means the queue is logically
                // empty; with one, the stub is dequeued and skipped.
                if next.is_null() {
                    return None;
                }
                *self.oldest.get() = next;
                oldest = next;
                next = (*oldest).next.load(Ordering::Acquire);
            }

            if next.is_null() {
                // The candidate lacks a successor. If it is not also the
                // newest node, a producer is mid-enqueue; report empty and
                // let the consumer retry.
                let newest = self.newest.load(Ordering::Acquire);
                if oldest != newest {
                    return None;
                }
                // Put the stub back so the candidate gains a successor.
                self.put_node(self.stub);
                next = (*oldest).next.load(Ordering::Acquire);
                if next.is_null() {
                    return None;
                }
            }
            Some(oldest)
        }
    }

    /// Dequeue the oldest value. Consumer-side only.
    pub fn poll(&self) -> Option<T> {
        let oldest = self.get_oldest()?;
        unsafe {
            // get_oldest guarantees a non-null successor, so the consumer
            // end stays non-null.
            *self.oldest.get() = (*oldest).next.load(Ordering::Acquire);
            let node = Box::from_raw(oldest);
            node.value
        }
    }

    /// Whether the queue is idle: no entries, none in flight.
    /// Consumer-side only.
    pub fn is_idle(&self) -> bool {
        unsafe {
            *self.oldest.get() == self.stub && self.newest.load(Ordering::Acquire) == self.stub
        }
    }
}

impl<T> Drop for FunnelQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
        unsafe {
            drop(Box::from_raw(self.stub));
        }
    }
}

impl<T> Default for FunnelQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How long a consumer sleeps before re-polling, bounding the effect of a
/// wakeup lost to the producers' weak-progress window.
const CONSUMER_NAP: Duration = Duration::from_millis(10);

/// A request queue: the funnel pair plus consumer wakeup.
pub struct RequestQueue {
    main: FunnelQueue<Box<Request>>,
    retry: FunnelQueue<Box<Request>>,
    state: Mutex<bool>, // finished
    wakeup: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            main: FunnelQueue::new(),
            retry: FunnelQueue::new(),
            state: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Enqueue a new request.
    pub fn enqueue(&self, request: Box<Request>) {
        self.main.put(request);
        self.wakeup.notify_one();
    }

    /// Enqueue a request returning from a page read; it jumps ahead of
    /// new work.
    pub fn enqueue_retry(&self, request: Box<Request>) {
        self.retry.put(request);
        self.wakeup.notify_one();
    }

    /// Dequeue the next request, blocking until one arrives or the queue
    /// is finished and drained. Consumer-side only.
    pub fn dequeue(&self) -> Option<Box<Request>> {
        loop {
            if let Some(request) = self.retry.poll() {
                return Some(request);
            }
            if let Some(request) = self.main.poll() {
                return Some(request);
            }
            let finished = self.state.lock().unwrap();
            if *finished && self.retry.is_idle() && self.main.is_idle() {
                return None;
            }
            let _unused = self
                .wakeup
                .wait_timeout(finished, CONSUMER_NAP)
                .unwrap();
        }
    }

    /// Mark the queue finished. The consumer drains and then stops.
    pub fn finish(&self) {
        *self.state.lock().unwrap() = true;
        self.wakeup.notify_all();
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-zone request queues of an index.
pub struct ZoneQueues {
    queues: Vec<Arc<RequestQueue>>,
}

impl ZoneQueues {
    pub fn new(zone_count: u32) -> Self {
        ZoneQueues {
            queues: (0..zone_count).map(|_| Arc::new(RequestQueue::new())).collect(),
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.queues.len() as u32
    }

    pub fn zone(&self, zone: u32) -> &Arc<RequestQueue> {
        &self.queues[zone as usize]
    }

    /// Enqueue to the request's owning zone.
    pub fn enqueue(&self, request: Box<Request>) {
        self.queues[request.zone as usize].enqueue(request);
    }

    /// Re-admit a request after its page read completed.
    pub fn requeue(&self, request: Box<Request>) {
        self.queues[request.zone as usize].enqueue_retry(request);
    }

    pub fn finish_all(&self) {
        for queue in &self.queues {
            queue.finish();
        }
    }
}
