//! Hierarchical cancellation used to tear down group loops and coordinators.
//!
//! A source owns the nodes of the sources linked to it; children only keep a
//! weak reference to their parent. Closing a source cancels it and then walks
//! its subtree top-down, so after `close()` returns every descendant is closed.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

struct Node {
    cancelled: AtomicBool,
    parent: Weak<Node>,
    children: Mutex<Vec<Arc<Node>>>,
    /// Wakes async waiters. Derived from the parent's waker.
    waker: CancellationToken,
}

impl Node {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            waker: CancellationToken::new(),
        })
    }

    fn child_of(parent: &Arc<Node>) -> Arc<Self> {
        let child = Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Arc::downgrade(parent),
            children: Mutex::new(Vec::new()),
            waker: parent.waker.child_token(),
        });

        // Checked under the parent's child lock: a concurrent close either
        // sees this child in its drain or has already flagged the parent.
        let mut children = parent.children.lock().unwrap_or_else(PoisonError::into_inner);
        if parent.is_cancellation_requested() {
            drop(children);
            child.cancelled.store(true, Ordering::Release);
            child.waker.cancel();
        } else {
            children.push(child.clone());
        }
        child
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_cancellation_requested(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut ancestor = self.parent.upgrade();
        while let Some(node) = ancestor {
            if node.is_cancelled() {
                return true;
            }
            ancestor = node.parent.upgrade();
        }
        false
    }

    fn take_children(&self) -> Vec<Arc<Node>> {
        core::mem::take(&mut *self.children.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn close(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.waker.cancel();

        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|child| !Arc::ptr_eq(child, self));
        }

        let mut pending = self.take_children();
        while let Some(node) = pending.pop() {
            if node.cancelled.swap(true, Ordering::AcqRel) {
                continue;
            }
            node.waker.cancel();
            pending.extend(node.take_children());
        }
    }
}

/// Observer side of a [`LinkedCancellationTokenSource`]. Cheap to clone.
#[derive(Clone)]
pub struct LinkedCancellationToken {
    node: Arc<Node>,
}

impl LinkedCancellationToken {
    /// True once this token or any of its ancestors was cancelled.
    pub fn is_cancellation_requested(&self) -> bool {
        self.node.is_cancellation_requested()
    }

    /// Resolves once this token or any of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        self.node.waker.cancelled().await
    }
}

impl fmt::Debug for LinkedCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedCancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}

/// Owner side of a cancellation node. Closed on drop.
pub struct LinkedCancellationTokenSource {
    node: Arc<Node>,
}

impl LinkedCancellationTokenSource {
    /// Creates a root source.
    pub fn new() -> Self {
        Self { node: Node::root() }
    }

    /// Creates a source that is closed whenever `parent` is cancelled.
    ///
    /// Linking to an already cancelled token yields a closed source.
    pub fn linked(parent: &LinkedCancellationToken) -> Self {
        Self {
            node: Node::child_of(&parent.node),
        }
    }

    pub fn token(&self) -> LinkedCancellationToken {
        LinkedCancellationToken {
            node: self.node.clone(),
        }
    }

    /// Cancels this source and closes all of its descendants before returning.
    pub fn close(&self) {
        self.node.close();
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_cancelled()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.node.is_cancellation_requested()
    }
}

impl Default for LinkedCancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkedCancellationTokenSource {
    fn drop(&mut self) {
        self.node.close();
    }
}

impl fmt::Debug for LinkedCancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedCancellationTokenSource")
            .field("closed", &self.is_closed())
            .finish()
    }
}
