use mosaic_rrn::core::{AdjacencyEdge, AdjacencyGraph, RasterGrid};
use mosaic_rrn::io::{MemoryDriver, MemoryRaster, RasterHandle};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn raster(driver: &MemoryDriver, path: &str, x_min: f64, y_min: f64, projection: &str) -> RasterHandle {
    let grid = RasterGrid::new(x_min, x_min + 10.0, y_min, y_min + 10.0, 1.0, 1.0, projection)
        .expect("valid grid");
    driver.insert(path, MemoryRaster::from_fn(grid, 1, |_, r, c| (r + c) as f64).expect("raster"));
    RasterHandle::open(driver, path).expect("raster opens")
}

/// Four 10x10 rasters in a 2x2 layout overlapping by two pixels
fn mosaic(driver: &MemoryDriver) -> AdjacencyGraph {
    let mut graph = AdjacencyGraph::new();
    graph.add(raster(driver, "nw.tif", 0.0, 8.0, "LOCAL"));
    graph.add(raster(driver, "ne.tif", 8.0, 8.0, "LOCAL"));
    graph.add(raster(driver, "sw.tif", 0.0, 0.0, "LOCAL"));
    graph.add(raster(driver, "se.tif", 8.0, 0.0, "LOCAL"));
    graph
}

fn task_set(graph: &AdjacencyGraph) -> BTreeSet<(PathBuf, PathBuf, u64)> {
    graph
        .tasks()
        .iter()
        .map(|task| {
            (
                task.source().path().to_path_buf(),
                task.target().path().to_path_buf(),
                task.weight(),
            )
        })
        .collect()
}

/// Lightest total weight of any spanning tree, by exhaustive search
fn brute_force_spanning_weight(n_vertices: usize, edges: &[AdjacencyEdge]) -> u64 {
    let mut best = u64::MAX;
    for mask in 0u32..(1 << edges.len()) {
        if mask.count_ones() as usize != n_vertices - 1 {
            continue;
        }
        let mut component: Vec<usize> = (0..n_vertices).collect();
        let mut weight = 0;
        for (i, edge) in edges.iter().enumerate() {
            if mask & (1 << i) != 0 {
                weight += edge.weight;
                let (from, to) = (component[edge.a], component[edge.b]);
                for c in component.iter_mut() {
                    if *c == from {
                        *c = to;
                    }
                }
            }
        }
        if component.iter().all(|&c| c == component[0]) {
            best = best.min(weight);
        }
    }
    best
}

#[test]
fn test_two_by_two_mosaic_spanning_tree() {
    let driver = MemoryDriver::new();
    let graph = mosaic(&driver);

    // Four side overlaps of 2x10 and two diagonal overlaps of 2x2
    assert_eq!(graph.edges().len(), 6);
    let mut weights: Vec<u64> = graph.edges().iter().map(|e| e.weight).collect();
    weights.sort_unstable();
    assert_eq!(weights, vec![4, 4, 20, 20, 20, 20]);

    let tree = graph.build();
    assert_eq!(tree.len(), graph.vertex_count() - 1);
    assert_eq!(graph.spanning_weight(), 4 + 4 + 20);
    assert_eq!(
        graph.spanning_weight(),
        brute_force_spanning_weight(graph.vertex_count(), graph.edges())
    );
}

#[test]
fn test_tasks_are_idempotent() {
    let driver = MemoryDriver::new();
    let graph = mosaic(&driver);

    let first = task_set(&graph);
    let second = task_set(&graph);
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);

    for (source, target, _) in &first {
        assert!(source < target, "{:?} should be the source of {:?}", source, target);
    }
}

#[test]
fn test_adding_raster_recomputes_tree() {
    let driver = MemoryDriver::new();
    let mut graph = mosaic(&driver);
    assert_eq!(graph.build().len(), 3);

    let version = graph.version();
    graph.add(raster(&driver, "center.tif", 4.0, 4.0, "LOCAL"));
    assert!(graph.version() > version);

    let tree = graph.build();
    assert_eq!(tree.len(), 4);
    assert_eq!(
        graph.spanning_weight(),
        brute_force_spanning_weight(graph.vertex_count(), graph.edges())
    );
}

#[test]
fn test_incomparable_raster_stays_disconnected() {
    let driver = MemoryDriver::new();
    let mut graph = mosaic(&driver);
    graph.add(raster(&driver, "other.tif", 0.0, 0.0, "EPSG:4326"));

    assert_eq!(graph.vertex_count(), 5);
    assert_eq!(graph.edges().len(), 6);
    let tasks = graph.tasks();
    assert_eq!(tasks.len(), 3);
    assert!(tasks
        .iter()
        .all(|task| task.source().path() != Path::new("other.tif")
            && task.target().path() != Path::new("other.tif")));
}

#[test]
fn test_half_pixel_shifted_raster_has_no_edge() {
    let driver = MemoryDriver::new();
    let mut graph = AdjacencyGraph::new();
    graph.add(raster(&driver, "a.tif", 0.0, 0.0, "LOCAL"));
    graph.add(raster(&driver, "shifted.tif", 5.5, 0.0, "LOCAL"));

    assert_eq!(graph.vertex_count(), 2);
    assert!(graph.edges().is_empty());
    assert!(graph.tasks().is_empty());

    // A lattice-aligned neighbour of the same footprint still connects
    graph.add(raster(&driver, "b.tif", 5.0, 0.0, "LOCAL"));
    let tasks = task_set(&graph);
    assert_eq!(tasks.len(), 1);
    assert!(tasks.contains(&(PathBuf::from("a.tif"), PathBuf::from("b.tif"), 50)));
}

#[test]
fn test_export_dot() {
    let driver = MemoryDriver::new();
    let graph = mosaic(&driver);

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("mosaic.dot");
    graph.export_dot(&path).expect("graph exported");

    let dot = std::fs::read_to_string(&path).expect("dot file readable");
    assert!(dot.starts_with("graph mosaic {"));
    assert_eq!(dot.matches(" -- ").count(), 3);
    for name in ["nw.tif", "ne.tif", "sw.tif", "se.tif"] {
        assert!(dot.contains(name), "missing node {}", name);
    }
}
