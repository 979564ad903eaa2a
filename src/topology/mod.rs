// Topology module - THE MAP
// Mutually confirmed adjacency from announced neighbor lists, and BFS routes over it

mod tracker;

pub use tracker::{TopologyConfig, TopologyError, TopologyTracker};
