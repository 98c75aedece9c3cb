use rustc_hash::FxHashMap;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReqError {
    #[error("Request {0} is not pending")]
    NotPending(Uuid),
    #[error("Request overlaps with an existing request")]
    Overlaps,
}

/// Tracks the historical page requests still in flight for one session.
///
/// Keyed by request id. A request leaves the map as soon as it settles, and the
/// same cursor cannot be requested twice while a request for it is pending.
#[derive(Debug, Default)]
pub struct RequestHandler {
    pending: FxHashMap<Uuid, FetchRange>,
}

impl RequestHandler {
    pub fn new() -> Self {
        RequestHandler {
            pending: FxHashMap::default(),
        }
    }

    pub fn add_request(&mut self, fetch: FetchRange) -> Result<Uuid, ReqError> {
        if self.pending.values().any(|existing| existing.same_with(&fetch)) {
            return Err(ReqError::Overlaps);
        }

        let id = Uuid::new_v4();
        self.pending.insert(id, fetch);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<FetchRange> {
        self.pending.get(&id).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn mark_completed(&mut self, id: Uuid) -> Result<FetchRange, ReqError> {
        self.pending.remove(&id).ok_or(ReqError::NotPending(id))
    }

    pub fn mark_failed(&mut self, id: Uuid, reason: &str) -> Result<FetchRange, ReqError> {
        let fetch = self.mark_completed(id)?;
        log::debug!("Request {id} before {} failed: {reason}", fetch.cursor());
        Ok(fetch)
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum FetchRange {
    /// Bars strictly older than `end_time`, snapshotted from the cursor value `cursor`.
    Before { cursor: u64, end_time: u64 },
}

impl FetchRange {
    pub fn cursor(&self) -> u64 {
        match self {
            FetchRange::Before { cursor, .. } => *cursor,
        }
    }

    fn same_with(&self, other: &FetchRange) -> bool {
        self.cursor() == other.cursor()
    }
}
