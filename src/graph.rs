// src/graph.rs
//! Frame graph: the per-frame pass sequence with declared read/write sets.
//!
//! Queue fences are derived from the declarations instead of being placed by
//! hand next to each submit. The schedule is computed once at startup, so an
//! ordering mistake (a pass reading a buffer nothing wrote) fails fast there
//! rather than surfacing as GPU corruption mid-frame.

use crate::error::{Error, Result};

/// Logical execution queue. The backend may map several of these onto one
/// hardware queue; the fence contract is expressed against the logical ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

/// Index into the orchestrator's resource table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u16);

/// Identifies a pass by position in the declared frame order.
pub type PassId = usize;

#[derive(Clone, Debug)]
pub struct PassDesc {
    pub name: &'static str,
    pub queue: QueueKind,
    pub reads: Vec<ResourceId>,
    pub writes: Vec<ResourceId>,
}

/// One step of the computed schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Record and submit pass `0` in declared order.
    Execute(PassId),
    /// Before executing anything further on `queue`, wait until the queue of
    /// pass `wait_for` has completed that pass.
    Fence { wait_for: PassId, queue: QueueKind },
}

#[derive(Clone, Debug, Default)]
pub struct Schedule {
    pub steps: Vec<Step>,
}

impl Schedule {
    pub fn fence_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Fence { .. }))
            .count()
    }

    /// Fence inserted immediately before `pass`, if any.
    pub fn fence_before(&self, pass: PassId) -> Option<PassId> {
        let mut pending = None;
        for step in &self.steps {
            match *step {
                Step::Fence { wait_for, .. } => pending = Some(wait_for),
                Step::Execute(p) => {
                    if p == pass {
                        return pending;
                    }
                    pending = None;
                }
            }
        }
        None
    }
}

/// Ordered pass list plus the resources the frame imports from outside
/// (already valid before the first pass, e.g. the uploaded instance data).
#[derive(Default)]
pub struct FrameGraph {
    passes: Vec<PassDesc>,
    external: Vec<ResourceId>,
}

impl FrameGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource written before the frame begins.
    pub fn import(&mut self, resource: ResourceId) -> &mut Self {
        self.external.push(resource);
        self
    }

    pub fn add_pass(
        &mut self,
        name: &'static str,
        queue: QueueKind,
        reads: &[ResourceId],
        writes: &[ResourceId],
    ) -> PassId {
        self.passes.push(PassDesc {
            name,
            queue,
            reads: reads.to_vec(),
            writes: writes.to_vec(),
        });
        self.passes.len() - 1
    }

    pub fn pass(&self, id: PassId) -> &PassDesc {
        &self.passes[id]
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Compute the fence schedule for the declared order.
    ///
    /// For each pass, every read (and every write over a resource someone
    /// already read — write-after-read) locates the most recent cross-queue
    /// producer; one fence per producer pass is inserted ahead of the
    /// consumer, deduplicated so an already-awaited producer is not awaited
    /// again. Same-queue dependencies need no fence: submission order plus
    /// intra-queue barriers cover them.
    pub fn schedule(&self) -> Result<Schedule> {
        // last_writer[resource] / last_readers[resource] track hazards.
        let mut last_writer: Vec<Option<PassId>> = Vec::new();
        let mut last_readers: Vec<Vec<PassId>> = Vec::new();
        let grow = |w: &mut Vec<Option<PassId>>, r: &mut Vec<Vec<PassId>>, id: ResourceId| {
            let n = id.0 as usize + 1;
            if w.len() < n {
                w.resize(n, None);
                r.resize(n, Vec::new());
            }
        };

        let mut external: Vec<bool> = Vec::new();
        for res in &self.external {
            let n = res.0 as usize + 1;
            if external.len() < n {
                external.resize(n, false);
            }
            external[res.0 as usize] = true;
        }
        let is_external = |res: ResourceId| {
            external.get(res.0 as usize).copied().unwrap_or(false)
        };

        let mut steps = Vec::with_capacity(self.passes.len() * 2);
        // Per queue, the set of passes already awaited (transitively safe).
        let mut satisfied: Vec<(QueueKind, PassId)> = Vec::new();

        for (id, pass) in self.passes.iter().enumerate() {
            let mut dependencies: Vec<PassId> = Vec::new();

            for &res in &pass.reads {
                grow(&mut last_writer, &mut last_readers, res);
                match last_writer[res.0 as usize] {
                    Some(writer) => dependencies.push(writer),
                    None => {
                        if !is_external(res) {
                            return Err(Error::UnwrittenResource {
                                pass: pass.name,
                                resource: res.0,
                            });
                        }
                    }
                }
            }
            // Write-after-read: readers on other queues must finish before
            // this pass overwrites the resource.
            for &res in &pass.writes {
                grow(&mut last_writer, &mut last_readers, res);
                for &reader in &last_readers[res.0 as usize] {
                    dependencies.push(reader);
                }
                // Write-after-write across queues.
                if let Some(writer) = last_writer[res.0 as usize] {
                    dependencies.push(writer);
                }
            }

            dependencies.sort_unstable();
            dependencies.dedup();

            // Latest dependency first: a fence on a queue's newest pass
            // subsumes every older pass on that queue, so one wait covers
            // the whole chain.
            for dep in dependencies.into_iter().rev() {
                let dep_queue = self.passes[dep].queue;
                if dep_queue == pass.queue {
                    continue; // same queue: submission order suffices
                }
                let already = satisfied
                    .iter()
                    .any(|&(q, p)| q == pass.queue && p >= dep && self.passes[p].queue == dep_queue);
                if !already {
                    steps.push(Step::Fence {
                        wait_for: dep,
                        queue: pass.queue,
                    });
                    satisfied.push((pass.queue, dep));
                }
            }

            steps.push(Step::Execute(id));

            for &res in &pass.reads {
                last_readers[res.0 as usize].push(id);
            }
            for &res in &pass.writes {
                last_writer[res.0 as usize] = Some(id);
                last_readers[res.0 as usize].clear();
            }
        }

        let schedule = Schedule { steps };
        log::debug!(
            "frame graph: {} passes, {} fences",
            self.passes.len(),
            schedule.fence_count()
        );
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH: ResourceId = ResourceId(0);
    const PYRAMID: ResourceId = ResourceId(1);
    const VISIBILITY: ResourceId = ResourceId(2);
    const SCAN: ResourceId = ResourceId(3);
    const ARGS: ResourceId = ResourceId(4);
    const INSTANCES: ResourceId = ResourceId(5);

    /// The per-frame sequence from the culling orchestrator, reduced.
    fn culling_graph() -> FrameGraph {
        let mut g = FrameGraph::new();
        g.import(INSTANCES);
        g.add_pass("depth", QueueKind::Graphics, &[INSTANCES], &[DEPTH]);
        g.add_pass("pyramid", QueueKind::Compute, &[DEPTH], &[PYRAMID]);
        g.add_pass(
            "cull",
            QueueKind::Compute,
            &[PYRAMID, INSTANCES],
            &[VISIBILITY],
        );
        g.add_pass("scan", QueueKind::Compute, &[VISIBILITY], &[SCAN]);
        g.add_pass("fill", QueueKind::Compute, &[SCAN, VISIBILITY], &[ARGS]);
        g.add_pass("draw", QueueKind::Graphics, &[ARGS, INSTANCES], &[DEPTH]);
        g
    }

    #[test]
    fn cross_queue_reads_get_fences() {
        let schedule = culling_graph().schedule().unwrap();

        // pyramid (compute) reads depth written on graphics -> fence.
        assert_eq!(schedule.fence_before(1), Some(0));
        // draw (graphics) reads args written on compute -> fence.
        assert_eq!(schedule.fence_before(5), Some(4));
    }

    #[test]
    fn same_queue_chain_needs_no_fences() {
        let schedule = culling_graph().schedule().unwrap();
        // cull -> scan -> fill are all compute-queue; order suffices.
        assert_eq!(schedule.fence_before(3), None);
        assert_eq!(schedule.fence_before(4), None);
        // Exactly the two cross-queue fences overall.
        assert_eq!(schedule.fence_count(), 2);
    }

    #[test]
    fn execution_order_is_declaration_order() {
        let schedule = culling_graph().schedule().unwrap();
        let order: Vec<PassId> = schedule
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Execute(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn unwritten_read_is_rejected() {
        let mut g = FrameGraph::new();
        g.add_pass("cull", QueueKind::Compute, &[PYRAMID], &[VISIBILITY]);
        match g.schedule() {
            Err(Error::UnwrittenResource { pass, resource }) => {
                assert_eq!(pass, "cull");
                assert_eq!(resource, PYRAMID.0);
            }
            other => panic!("expected UnwrittenResource, got {other:?}"),
        }
    }

    #[test]
    fn imported_resources_need_no_writer() {
        let mut g = FrameGraph::new();
        g.import(INSTANCES);
        g.add_pass("depth", QueueKind::Graphics, &[INSTANCES], &[DEPTH]);
        assert!(g.schedule().is_ok());
    }

    #[test]
    fn write_after_read_across_queues_fences() {
        let mut g = FrameGraph::new();
        g.import(INSTANCES);
        // Graphics reads depth, then compute overwrites it.
        g.add_pass("seed", QueueKind::Graphics, &[INSTANCES], &[DEPTH]);
        g.add_pass("show", QueueKind::Graphics, &[DEPTH], &[]);
        g.add_pass("clobber", QueueKind::Compute, &[], &[DEPTH]);
        let schedule = g.schedule().unwrap();
        assert_eq!(schedule.fence_before(2), Some(1));
    }
}
