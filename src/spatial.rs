//! R-tree over a node set, used for every nearest-neighbour query.
//!
//! The index is bulk-loaded once per entity class and only read afterwards,
//! so it can be shared by reference across rayon workers.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use nalgebra::Point3;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::datatypes::{NodeArena, NodeId};

#[derive(Debug, Clone, PartialEq)]
struct IndexedNode {
    id: NodeId,
    position: [f64; 3],
}

impl RTreeObject for IndexedNode {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedNode {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        let dz = self.position[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// A master candidate: node id and its distance to the query point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub node: NodeId,
    pub distance: f64,
}

/// Orders by distance, equal distances by smaller node id
fn by_distance_then_id(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.node.cmp(&b.node))
}

pub struct SpatialIndex {
    tree: RTree<IndexedNode>,
    members: BTreeSet<NodeId>,
}

impl SpatialIndex {
    /// Bulk loads an index over a subset of the arena
    ///
    /// # Arguments
    /// * `nodes` - The node arena holding positions
    /// * `ids` - The node ids to index. Ids missing from the arena are skipped.
    pub fn build<'a, I>(nodes: &NodeArena, ids: I) -> SpatialIndex
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut members = BTreeSet::new();
        let entries: Vec<IndexedNode> = ids
            .into_iter()
            .filter_map(|id| {
                let p = nodes.position(*id)?;
                members.insert(*id);
                Some(IndexedNode {
                    id: *id,
                    position: [p.x, p.y, p.z],
                })
            })
            .collect();

        SpatialIndex {
            tree: RTree::bulk_load(entries),
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// True if the node itself is part of the indexed set
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Nearest indexed node to a point. Equal distances resolve to the
    /// smaller node id.
    pub fn nearest(&self, point: &Point3<f64>) -> Option<Neighbor> {
        let query = [point.x, point.y, point.z];
        let mut iter = self.tree.nearest_neighbor_iter(&query);
        let first = iter.next()?;
        let first_d2 = first.distance_2(&query);

        let mut best = first.id;
        for candidate in iter {
            if candidate.distance_2(&query) > first_d2 {
                break;
            }
            best = best.min(candidate.id);
        }

        Some(Neighbor {
            node: best,
            distance: first_d2.sqrt(),
        })
    }

    /// Up to `k` nearest indexed nodes within `radius`
    ///
    /// # Arguments
    /// * `point` - The query point
    /// * `k` - Maximum number of neighbours
    /// * `radius` - Search radius
    ///
    /// # Returns
    /// Neighbours sorted by distance, ties broken by the smaller node id
    pub fn k_nearest_within(&self, point: &Point3<f64>, k: usize, radius: f64) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let query = [point.x, point.y, point.z];
        let radius_2 = radius * radius;

        // Walk outwards; keep going past k only while distances tie with
        // the k-th so the id tie-break sees every equal candidate
        let mut found: Vec<Neighbor> = Vec::with_capacity(k);
        let mut kth_2 = f64::INFINITY;
        for entry in self.tree.nearest_neighbor_iter(&query) {
            let d2 = entry.distance_2(&query);
            if radius_2.is_nan() || d2 > radius_2 || d2 > kth_2 {
                break;
            }
            found.push(Neighbor {
                node: entry.id,
                distance: d2.sqrt(),
            });
            if found.len() == k {
                kth_2 = d2;
            }
        }

        found.sort_by(by_distance_then_id);
        found.truncate(k);
        found
    }
}
