//! Built-in workloads. A submission names its code by one of the names
//! resolved here; workers look the name up again before executing.

use common::Workload;

pub mod vertex_degree;
pub mod word_count;

/// Look up a built-in workload by its submission name.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "word-count" => Some(Workload {
            map_fn: word_count::map,
            reduce_fn: word_count::reduce,
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            reduce_fn: vertex_degree::reduce,
        }),
        _ => None,
    }
}
