//! Live block-backup subsystem: a copy-before-write filter, a cluster-
//! granular block-copy engine, dirty bitmaps, a rate-limited backup job
//! driver, and the replication glue that composes them for primary/
//! secondary failover (spec.md §2).

pub mod backup_job;
pub mod bitmap;
pub mod block_copy;
pub mod cbw;
pub mod error;
pub mod node;
pub mod replication;
pub mod reqlist;

pub use backup_job::{
    BackupJob, BackupJobConfig, BitmapSyncMode, IoErrorPolicy, JobStatus, JobTxn, SyncMode,
};
pub use bitmap::{BitmapHandle, BitmapTable, DirtyBitmap};
pub use block_copy::{BlockCopyState, ProgressSink, MAX_COPY_SIZE};
pub use cbw::{CbwFilter, ChildPerm, OnCbwError};
pub use error::{Error, IoSide, Result};
pub use node::{BlockNode, FileNode, MemNode, WriteFlags};
pub use replication::{ReplicationMode, ReplicationStage, ReplicationState};

/// `cbw_append` (spec.md §6): appends a CBW filter above `source`, returning
/// the filter and a handle to its block-copy engine. `cbw_drop` is simply
/// dropping the returned `Arc` after `block_copy_state().drain()`.
pub fn cbw_append(
    source: std::sync::Arc<dyn BlockNode>,
    target: std::sync::Arc<dyn BlockNode>,
    bitmap: Option<&DirtyBitmap>,
    discard_source: bool,
    min_cluster_size: u64,
    on_cbw_error: OnCbwError,
    cbw_timeout: Option<std::time::Duration>,
) -> Result<std::sync::Arc<CbwFilter>> {
    CbwFilter::new(
        source,
        target,
        bitmap,
        discard_source,
        min_cluster_size,
        on_cbw_error,
        cbw_timeout,
    )
}

/// `cbw_drop` (spec.md §6): drains the filter's engine so no copy started
/// before the call outlives the filter's removal from the graph.
pub fn cbw_drop(filter: std::sync::Arc<CbwFilter>) {
    filter.block_copy_state().drain();
}
