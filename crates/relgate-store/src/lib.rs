pub mod memory;

pub use memory::InMemoryGraph;
