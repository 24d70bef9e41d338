pub mod blob;
pub mod parquet;

pub use blob::{BlobError, BlobStore, LocalBlobStore};
pub use parquet::{
    consumption_partition_path, cost_partition_path, rates_partition_path, PartitionWriter,
};
