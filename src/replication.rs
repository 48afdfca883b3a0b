//! Replication Glue (spec.md §4.F, brief): composes a [`BackupJob`] over a
//! fixed `active_disk -> hidden_disk -> secondary_disk` backing chain so the
//! secondary reads through copy-before-write while the primary drains
//! writes into `hidden_disk`. Grounded in
//! `examples/original_source/block/replication.c` (the
//! `BLOCK_REPLICATION_*` stage enum and `replication_start`/`_stop` shape)
//! and `examples/original_source/include/block/replication.h` (the
//! `ReplicationOps`/`replication_new`/`_remove` surface).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::backup_job::{BackupJob, BackupJobConfig, IoErrorPolicy, JobTxn, SyncMode};
use crate::error::{Error, Result};
use crate::node::BlockNode;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplicationMode {
    Primary,
    Secondary,
}

/// `BLOCK_REPLICATION_*` (`block/replication.c`): the per-node replication
/// lifecycle. `Failover` means the active-commit squashing `active_disk`
/// into `secondary_disk` is running in the background.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplicationStage {
    None,
    Running,
    Failover,
    FailoverFailed,
    Done,
}

struct Inner {
    stage: ReplicationStage,
    error: Option<String>,
    backup_job: Option<Arc<BackupJob>>,
}

/// One replication participant. On the secondary side this owns the
/// `active_disk -> hidden_disk -> secondary_disk` chain and the backup job
/// draining writes from `active_disk` into `hidden_disk`; on the primary
/// side it is a thin handle whose `start`/`stop` mirror the secondary's
/// lifecycle so callers don't need to special-case mode.
pub struct ReplicationState {
    mode: ReplicationMode,
    active_disk: Arc<dyn BlockNode>,
    hidden_disk: Arc<dyn BlockNode>,
    secondary_disk: Arc<dyn BlockNode>,
    inner: Mutex<Inner>,
}

impl ReplicationState {
    /// `replication_new` (`include/block/replication.h`).
    pub fn new(
        mode: ReplicationMode,
        active_disk: Arc<dyn BlockNode>,
        hidden_disk: Arc<dyn BlockNode>,
        secondary_disk: Arc<dyn BlockNode>,
    ) -> Arc<Self> {
        Arc::new(ReplicationState {
            mode,
            active_disk,
            hidden_disk,
            secondary_disk,
            inner: Mutex::new(Inner {
                stage: ReplicationStage::None,
                error: None,
                backup_job: None,
            }),
        })
    }

    pub fn stage(&self) -> ReplicationStage {
        self.inner.lock().stage
    }

    /// `replication_start` (`block/replication.c`): on the secondary, appends
    /// a CBW filter above `active_disk` and starts a `sync=none` backup job
    /// copying pre-write contents into `hidden_disk`, so `active_disk` stays
    /// a point-in-time view the primary can fail back to.
    pub fn start(&self, txn: Option<Arc<JobTxn>>) -> Result<()> {
        let mut g = self.inner.lock();
        if g.stage == ReplicationStage::Running || g.stage == ReplicationStage::Failover {
            return Err(Error::Busy("replication already running".into()));
        }
        if self.mode == ReplicationMode::Primary {
            g.stage = ReplicationStage::Running;
            return Ok(());
        }

        let mut cfg = BackupJobConfig::new(
            "replication-backup",
            self.active_disk.clone(),
            self.hidden_disk.clone(),
        )
        .with_sync_mode(SyncMode::None)
        .with_error_policy(IoErrorPolicy::Stop, IoErrorPolicy::Stop);
        if let Some(txn) = txn {
            cfg = cfg.with_txn(txn);
        }
        let job = BackupJob::create(cfg)?;
        g.backup_job = Some(job);
        g.stage = ReplicationStage::Running;
        info!(mode = ?self.mode, "replication started");
        Ok(())
    }

    /// `replication_do_checkpoint` (`block/replication.c`): secondary
    /// checkpoints have nothing to do since the `sync=none` job's CBW filter
    /// is already draining every write continuously; kept for interface
    /// symmetry with the primary.
    pub fn do_checkpoint(&self) -> Result<()> {
        let g = self.inner.lock();
        if g.stage != ReplicationStage::Running {
            return Err(Error::BadArgument(
                "checkpoint requires replication to be running".into(),
            ));
        }
        Ok(())
    }

    /// `replication_get_error` (`block/replication.c`): surfaces the sticky
    /// error set by a failed failover, if any.
    pub fn get_error(&self) -> Result<()> {
        match &self.inner.lock().error {
            Some(msg) => Err(Error::BadArgument(msg.clone())),
            None => Ok(()),
        }
    }

    /// `replication_stop` (`block/replication.c`): stops the draining backup
    /// job. With `failover = true`, additionally runs an active-commit
    /// squashing `active_disk`'s accumulated writes into `secondary_disk`,
    /// transitioning `Failover -> {Done | FailoverFailed}`.
    pub fn stop(&self, failover: bool) -> Result<()> {
        {
            let mut g = self.inner.lock();
            if let Some(job) = g.backup_job.take() {
                job.cancel();
            }
            if !failover {
                g.stage = ReplicationStage::Done;
                return Ok(());
            }
            g.stage = ReplicationStage::Failover;
        }

        let result = self.active_commit();

        let mut g = self.inner.lock();
        match result {
            Ok(()) => {
                g.stage = ReplicationStage::Done;
                info!("failover completed");
                Ok(())
            }
            Err(e) => {
                g.stage = ReplicationStage::FailoverFailed;
                g.error = Some(e.to_string());
                warn!(error = %e, "failover failed");
                Err(e)
            }
        }
    }

    /// Active commit: a one-shot `sync=full` job squashing `active_disk`
    /// into `secondary_disk`, mirroring `commit_active_start` in the
    /// original (`block/replication.c`).
    fn active_commit(&self) -> Result<()> {
        let cfg = BackupJobConfig::new(
            "replication-active-commit",
            self.active_disk.clone(),
            self.secondary_disk.clone(),
        )
        .with_sync_mode(SyncMode::Full)
        .with_error_policy(IoErrorPolicy::Report, IoErrorPolicy::Report);
        let job = BackupJob::create(cfg)?;
        job.run()
    }
}
