use crate::core::tasks::SpanningTask;
use crate::io::RasterHandle;
use crate::types::RrnResult;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Weighted overlap between two rasters, by vertex index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjacencyEdge {
    pub a: usize,
    pub b: usize,
    /// Overlap area in pixels, always positive
    pub weight: u64,
}

struct SpanningCache {
    version: u64,
    edges: Vec<AdjacencyEdge>,
}

/// Overlap graph of a mosaic and its minimum spanning tree.
///
/// Every overlapping pair of rasters is kept as an edge; the spanning tree
/// is derived on demand and cached until the next raster is added.
pub struct AdjacencyGraph {
    vertices: Vec<RasterHandle>,
    edges: Vec<AdjacencyEdge>,
    version: u64,
    spanning: Mutex<Option<SpanningCache>>,
}

impl Default for AdjacencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            version: 0,
            spanning: Mutex::new(None),
        }
    }

    /// Insert a raster and connect it to every raster it overlaps.
    ///
    /// Returns false if a raster with the same path is already present.
    pub fn add(&mut self, raster: RasterHandle) -> bool {
        if self.vertices.contains(&raster) {
            log::warn!("Raster {} already in the mosaic, ignored", raster);
            return false;
        }

        let index = self.vertices.len();
        for (other, existing) in self.vertices.iter().enumerate() {
            let weight = existing.overlap_area(&raster);
            if weight > 0 {
                log::debug!("Overlap {} <-> {}: {} pixels", existing.name(), raster.name(), weight);
                self.edges.push(AdjacencyEdge {
                    a: other,
                    b: index,
                    weight,
                });
            }
        }

        self.vertices.push(raster);
        self.version += 1;
        true
    }

    pub fn vertices(&self) -> &[RasterHandle] {
        &self.vertices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Every overlap edge, in insertion order
    pub fn edges(&self) -> &[AdjacencyEdge] {
        &self.edges
    }

    /// Incremented on every successful [`AdjacencyGraph::add`]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Compute the minimum spanning tree (a forest when the mosaic is not
    /// connected). Cheap when nothing was added since the last build.
    pub fn build(&self) -> Vec<AdjacencyEdge> {
        let mut cache = self.spanning.lock();
        if let Some(cached) = cache.as_ref().filter(|c| c.version == self.version) {
            return cached.edges.clone();
        }

        let edges = kruskal(self.vertices.len(), &self.edges);
        log::info!(
            "🕸️ Spanning tree: {} of {} overlap edges kept over {} rasters",
            edges.len(),
            self.edges.len(),
            self.vertices.len()
        );

        *cache = Some(SpanningCache {
            version: self.version,
            edges: edges.clone(),
        });
        edges
    }

    /// Spanning-tree edges as normalization tasks.
    ///
    /// The raster with the lexicographically smaller path is the source of
    /// each pair. Task ids follow the spanning-tree edge order.
    pub fn tasks(&self) -> Vec<Arc<SpanningTask>> {
        self.build()
            .into_iter()
            .enumerate()
            .map(|(id, edge)| {
                let (a, b) = (&self.vertices[edge.a], &self.vertices[edge.b]);
                let (source, target) = if a.path() <= b.path() { (a, b) } else { (b, a) };
                Arc::new(SpanningTask::new(id, source.clone(), target.clone(), edge.weight))
            })
            .collect()
    }

    /// Sum of spanning-tree edge weights
    pub fn spanning_weight(&self) -> u64 {
        self.build().iter().map(|edge| edge.weight).sum()
    }

    /// Spanning tree in Graphviz DOT format
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("graph mosaic {\n");
        for (index, vertex) in self.vertices.iter().enumerate() {
            let _ = writeln!(dot, "  {} [label=\"{}\"];", index, escape_label(&vertex.name()));
        }
        for edge in self.build() {
            let _ = writeln!(
                dot,
                "  {} -- {} [weight={}, label=\"{}\"];",
                edge.a, edge.b, edge.weight, edge.weight
            );
        }
        dot.push_str("}\n");
        dot
    }

    /// Write [`AdjacencyGraph::to_dot`] to `path`
    pub fn export_dot(&self, path: impl AsRef<Path>) -> RrnResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_dot())?;
        log::info!("📝 Adjacency graph written to {}", path.display());
        Ok(())
    }
}

fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Kruskal over `edges`; ties in weight keep insertion order
fn kruskal(n_vertices: usize, edges: &[AdjacencyEdge]) -> Vec<AdjacencyEdge> {
    let mut order: Vec<usize> = (0..edges.len()).collect();
    order.sort_by_key(|&i| (edges[i].weight, i));

    let mut sets = DisjointSets::new(n_vertices);
    let mut tree = Vec::with_capacity(n_vertices.saturating_sub(1));
    for i in order {
        let edge = edges[i];
        if sets.union(edge.a, edge.b) {
            tree.push(edge);
            if tree.len() + 1 == n_vertices {
                break;
            }
        }
    }
    tree
}

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`; false if already joined
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}
