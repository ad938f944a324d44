use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use probelink_wire::Tag;
use tracing::debug;

use crate::error::CorrelatorError;

/// Requests that expect a tagged status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Register,
    Configure,
    Unregister,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Register => "register",
            RequestKind::Configure => "configure",
            RequestKind::Unregister => "unregister",
        })
    }
}

/// A request awaiting its status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub tag: Tag,
    pub kind: RequestKind,
    pub issued_at: Instant,
}

/// Matches status replies to outstanding requests.
///
/// Tags are unique among pending requests only; a released tag may be handed
/// out again. At most one request per [`RequestKind`] may be pending. No
/// locking: the session's control thread is the only caller.
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<Tag, PendingRequest>,
    next_tag: Tag,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_tag: 1,
        }
    }

    /// Allocate a tag for a new `kind` request and record it as pending.
    pub fn issue(&mut self, kind: RequestKind) -> Result<Tag, CorrelatorError> {
        if self.is_pending(kind) {
            return Err(CorrelatorError::DuplicateRequest(kind));
        }

        let tag = self.free_tag();
        self.pending.insert(
            tag,
            PendingRequest {
                tag,
                kind,
                issued_at: Instant::now(),
            },
        );
        debug!(tag, %kind, "request issued");
        Ok(tag)
    }

    /// Remove the request matching `tag` and report its kind.
    ///
    /// Unknown tags (never issued, already resolved, or cleared by a reset)
    /// yield `None`.
    pub fn resolve(&mut self, tag: Tag, status: i32) -> Option<RequestKind> {
        let request = self.pending.remove(&tag)?;
        debug!(
            tag,
            kind = %request.kind,
            status,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "request resolved"
        );
        Some(request.kind)
    }

    /// Drop every pending request. Returns how many were cleared.
    pub fn reset(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.pending.values().any(|request| request.kind == kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, tag: Tag) -> Option<&PendingRequest> {
        self.pending.get(&tag)
    }

    fn free_tag(&mut self) -> Tag {
        loop {
            let candidate = self.next_tag;
            self.next_tag = match self.next_tag.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
