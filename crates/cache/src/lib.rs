mod layer;
mod memory;
mod remote;

pub use layer::{CacheClass, CacheLayer, CacheStats, SweepReport};
pub use memory::MemoryCache;
pub use remote::{RemoteCache, RemoteEntry};
