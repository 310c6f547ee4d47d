//! Time-sliced path request scheduler
//!
//! Requests share one query instance. Each tick the queue spends a global
//! iteration budget on the pending searches in round-robin order, so many
//! agents can ask for long paths without stalling a single frame.

use glam::Vec3;
use log::{debug, trace};
use nav_query::{NavMeshQuery, PolyRef, QueryFilter, QueryStatus};

pub type PathQueueRef = u32;

/// Handle returned when a request could not be queued
pub const DT_PATHQ_INVALID: PathQueueRef = 0;

const MAX_QUEUE: usize = 8;

/// Ticks a finished result is kept before its slot is reclaimed
const MAX_KEEP_ALIVE: u32 = 2;

#[derive(Debug, Clone)]
struct PathQuery {
    reference: PathQueueRef,
    start_pos: Vec3,
    end_pos: Vec3,
    start_ref: PolyRef,
    end_ref: PolyRef,
    path: Vec<PolyRef>,
    /// Empty until the search is started
    status: QueryStatus,
    keep_alive: u32,
    filter: QueryFilter,
}

impl Default for PathQuery {
    fn default() -> Self {
        Self {
            reference: DT_PATHQ_INVALID,
            start_pos: Vec3::ZERO,
            end_pos: Vec3::ZERO,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            path: Vec::new(),
            status: QueryStatus::empty(),
            keep_alive: 0,
            filter: QueryFilter::default(),
        }
    }
}

/// Fixed ring of path requests processed with sliced searches
#[derive(Debug, Clone)]
pub struct PathQueue<Q> {
    queue: Vec<PathQuery>,
    next_handle: PathQueueRef,
    max_path_size: usize,
    queue_head: usize,
    navquery: Q,
}

impl<Q: NavMeshQuery> PathQueue<Q> {
    /// Creates a queue whose results hold at most `max_path_size` polygons
    pub fn new(max_path_size: usize, navquery: Q) -> Self {
        Self {
            queue: vec![PathQuery::default(); MAX_QUEUE],
            next_handle: 1,
            max_path_size,
            queue_head: 0,
            navquery,
        }
    }

    /// Advances pending searches, spending at most `max_iters` iterations
    pub fn update(&mut self, max_iters: usize) {
        let mut iter_count = max_iters as i64;

        for _ in 0..MAX_QUEUE {
            let q = &mut self.queue[self.queue_head % MAX_QUEUE];

            if q.reference == DT_PATHQ_INVALID {
                self.queue_head += 1;
                continue;
            }

            // Free results nobody picked up.
            if q.status.is_complete() {
                q.keep_alive += 1;
                if q.keep_alive > MAX_KEEP_ALIVE {
                    trace!("path request {} expired unread", q.reference);
                    q.reference = DT_PATHQ_INVALID;
                    q.status = QueryStatus::empty();
                }
                self.queue_head += 1;
                continue;
            }

            if q.status.is_empty() {
                q.status =
                    self.navquery
                        .init_sliced_find_path(q.start_ref, q.end_ref, q.start_pos, q.end_pos, &q.filter);
            }
            if q.status.is_in_progress() {
                let budget = iter_count.max(0) as usize;
                let (status, iters) = self.navquery.update_sliced_find_path(budget);
                q.status = status;
                iter_count -= iters as i64;
            }
            if q.status.is_success() {
                q.status = self.navquery.finalize_sliced_find_path(&mut q.path, self.max_path_size);
            }

            if iter_count <= 0 {
                break;
            }
            self.queue_head += 1;
        }
    }

    /// Queues a search. Returns [`DT_PATHQ_INVALID`] when all slots are taken.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> PathQueueRef {
        let Some(slot) = self.queue.iter().position(|q| q.reference == DT_PATHQ_INVALID) else {
            debug!("path queue full, deferring request {start_ref:?} -> {end_ref:?}");
            return DT_PATHQ_INVALID;
        };

        let reference = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        if self.next_handle == DT_PATHQ_INVALID {
            self.next_handle = 1;
        }

        let q = &mut self.queue[slot];
        q.reference = reference;
        q.start_pos = start_pos;
        q.start_ref = start_ref;
        q.end_pos = end_pos;
        q.end_ref = end_ref;
        q.status = QueryStatus::empty();
        q.path.clear();
        q.filter = filter.clone();
        q.keep_alive = 0;

        reference
    }

    /// Status of a request, or FAILURE for unknown handles
    pub fn get_request_status(&self, reference: PathQueueRef) -> QueryStatus {
        self.find(reference)
            .map(|q| q.status)
            .unwrap_or(QueryStatus::FAILURE)
    }

    /// Copies the result into `path` and releases the slot. The handle is
    /// invalid afterwards.
    pub fn get_path_result(&mut self, reference: PathQueueRef, path: &mut Vec<PolyRef>, max_path: usize) -> QueryStatus {
        path.clear();
        let Some(q) = self
            .queue
            .iter_mut()
            .find(|q| q.reference != DT_PATHQ_INVALID && q.reference == reference)
        else {
            return QueryStatus::FAILURE;
        };

        let details = q.status.detail();
        q.reference = DT_PATHQ_INVALID;
        q.status = QueryStatus::empty();
        let n = q.path.len().min(max_path);
        path.extend_from_slice(&q.path[..n]);
        QueryStatus::success_with(details)
    }

    /// Number of slots currently holding a request
    pub fn pending_count(&self) -> usize {
        self.queue.iter().filter(|q| q.reference != DT_PATHQ_INVALID).count()
    }

    pub fn max_path_size(&self) -> usize {
        self.max_path_size
    }

    pub fn nav_query(&self) -> &Q {
        &self.navquery
    }

    fn find(&self, reference: PathQueueRef) -> Option<&PathQuery> {
        if reference == DT_PATHQ_INVALID {
            return None;
        }
        self.queue.iter().find(|q| q.reference == reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nav_common::Result;
    use nav_query::{GridMeshQuery, GridNavMesh};

    fn corridor_mesh() -> Result<GridNavMesh> {
        GridNavMesh::open(20, 1, 1.0, Vec3::ZERO)
    }

    fn request_across(queue: &mut PathQueue<GridMeshQuery<'_>>, mesh: &GridNavMesh) -> PathQueueRef {
        queue.request(
            mesh.cell_ref(0, 0),
            mesh.cell_ref(19, 0),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(19.5, 0.0, 0.5),
            &QueryFilter::default(),
        )
    }

    #[test]
    fn test_full_queue_rejects_request() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let handles: Vec<_> = (0..MAX_QUEUE).map(|_| request_across(&mut queue, &mesh)).collect();
        assert!(handles.iter().all(|&h| h != DT_PATHQ_INVALID));
        assert_eq!(queue.pending_count(), MAX_QUEUE);

        assert_eq!(request_across(&mut queue, &mesh), DT_PATHQ_INVALID);
        Ok(())
    }

    #[test]
    fn test_request_completes_and_is_consumed() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let handle = request_across(&mut queue, &mesh);
        assert!(queue.get_request_status(handle).is_empty());

        queue.update(100);
        assert!(queue.get_request_status(handle).is_success());

        let mut path = Vec::new();
        let status = queue.get_path_result(handle, &mut path, 64);
        assert!(status.is_success());
        assert!(!status.is_partial());
        assert_eq!(path.len(), 20);
        assert_eq!(path.first(), Some(&mesh.cell_ref(0, 0)));
        assert_eq!(path.last(), Some(&mesh.cell_ref(19, 0)));

        // One-shot: the handle is gone.
        assert!(queue.get_request_status(handle).is_failure());
        assert!(queue.get_path_result(handle, &mut path, 64).is_failure());
        assert!(path.is_empty());
        Ok(())
    }

    #[test]
    fn test_search_is_sliced_over_ticks() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let handle = request_across(&mut queue, &mesh);

        queue.update(3);
        assert!(queue.get_request_status(handle).is_in_progress());

        let mut ticks = 1;
        while queue.get_request_status(handle).is_in_progress() && ticks < 20 {
            queue.update(3);
            ticks += 1;
        }
        assert!(queue.get_request_status(handle).is_success());
        assert!(ticks > 1);
        Ok(())
    }

    #[test]
    fn test_unread_result_expires_after_keep_alive() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let handle = request_across(&mut queue, &mesh);

        queue.update(100);
        for _ in 0..MAX_KEEP_ALIVE {
            queue.update(100);
            assert!(queue.get_request_status(handle).is_success());
        }
        queue.update(100);
        assert!(queue.get_request_status(handle).is_failure());
        assert_eq!(queue.pending_count(), 0);
        Ok(())
    }

    #[test]
    fn test_invalid_endpoints_fail() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let handle = queue.request(
            PolyRef::NULL,
            mesh.cell_ref(3, 0),
            Vec3::ZERO,
            Vec3::new(3.5, 0.0, 0.5),
            &QueryFilter::default(),
        );
        queue.update(100);
        assert!(queue.get_request_status(handle).is_failure());
        assert!(queue.get_request_status(DT_PATHQ_INVALID).is_failure());
        Ok(())
    }

    #[test]
    fn test_handles_are_unique() -> Result<()> {
        let mesh = corridor_mesh()?;
        let mut queue = PathQueue::new(64, GridMeshQuery::new(&mesh));
        let a = request_across(&mut queue, &mesh);
        let b = request_across(&mut queue, &mesh);
        assert_ne!(a, b);
        assert!(a != DT_PATHQ_INVALID && b != DT_PATHQ_INVALID);
        Ok(())
    }
}
