//! Durable op logging for crash recovery.
//!
//! Layout of the log directory:
//!   - `<k>.log`: the k-th op applied by this replica, rmp-serde encoded.
//!     The counter `k` is monotonic and independent of consensus slots.
//!   - `global_seq.state`: decimal encoding of the highest applied slot,
//!     rewritten (truncate + write) after every append.

use std::path::PathBuf;

use crate::paxos::SeqNum;
use crate::server::{Op, ReplicaId};
use crate::utils::PaxkvError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Name of the global sequence state file inside the log directory.
const GLOBAL_SEQ_STATE: &str = "global_seq.state";

/// Durable op logger of one replica.
pub(crate) struct OpLogger {
    /// My replica ID.
    me: ReplicaId,

    /// The directory where the log files are stored.
    dir: PathBuf,

    /// Index of the next log file to write.
    counter: u64,

    /// Index of the next log file to replay during recovery.
    recover_index: u64,

    /// Whether to `fdatasync()` log files on append.
    sync: bool,
}

impl OpLogger {
    /// Opens the log directory, scanning for existing log files so that
    /// appends continue after the highest present index.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        dir: impl Into<PathBuf>,
        sync: bool,
    ) -> Result<Self, PaxkvError> {
        let dir = dir.into();
        let counter = match Self::max_log_index(&dir).await? {
            Some(max) => max + 1,
            None => 0,
        };
        if counter > 0 {
            pf_info!(me; "found {} log files in '{}'", counter, dir.display());
        }
        Ok(OpLogger {
            me,
            dir,
            counter,
            recover_index: 0,
            sync,
        })
    }

    /// Reports whether any logged ops exist to recover from.
    pub(crate) fn recoverable(&self) -> bool {
        self.counter > 0
    }

    /// Reads the persisted global sequence number, if present.
    pub(crate) async fn recover_global_seq(
        &self,
    ) -> Result<Option<SeqNum>, PaxkvError> {
        let path = self.dir.join(GLOBAL_SEQ_STATE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let global_seq = content.trim().parse::<SeqNum>()?;
        pf_info!(self.me; "recovered global_seq {} from '{}'",
                          global_seq, self.dir.display());
        Ok(Some(global_seq))
    }

    /// Is there an op left to replay?
    pub(crate) fn has_next_op(&self) -> bool {
        self.recover_index < self.counter
    }

    /// Reads out the next logged op in index order. A missing or corrupt
    /// log file is a hard error: recovery must not silently skip entries.
    pub(crate) async fn recover_op(&mut self) -> Result<Op, PaxkvError> {
        let path = self.dir.join(format!("{}.log", self.recover_index));
        let bytes = fs::read(&path).await?;
        let op = decode_from_slice(&bytes)?;
        self.recover_index += 1;
        Ok(op)
    }

    /// Appends one op to the log: writes `<k>.log`, then rewrites the
    /// global sequence state file. The caller passes the consensus slot
    /// being applied; it must be logged before the op is applied to the
    /// storage engine.
    pub(crate) async fn append(
        &mut self,
        op: &Op,
        global_seq: SeqNum,
    ) -> Result<(), PaxkvError> {
        if !fs::try_exists(&self.dir).await? {
            fs::create_dir_all(&self.dir).await?;
        }

        let path = self.dir.join(format!("{}.log", self.counter));
        let mut file = File::create(&path).await?;
        file.write_all(&encode_to_vec(op)?).await?;
        if self.sync {
            file.sync_data().await?;
        }

        fs::write(
            self.dir.join(GLOBAL_SEQ_STATE),
            global_seq.to_string(),
        )
        .await?;

        self.counter += 1;
        pf_trace!(self.me; "logged op {} at global_seq {}",
                           op.request_id, global_seq);
        Ok(())
    }

    /// Searches for the highest `<index>.log` file in the directory, or
    /// `None` if the directory is missing or holds no log files.
    async fn max_log_index(
        dir: &PathBuf,
    ) -> Result<Option<u64>, PaxkvError> {
        if !fs::try_exists(dir).await? {
            return Ok(None);
        }
        let mut max_index = None;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(index) = stem.parse::<u64>() {
                    max_index = Some(max_index.map_or(index, |m: u64| {
                        if index > m {
                            index
                        } else {
                            m
                        }
                    }));
                }
            }
        }
        Ok(max_index)
    }
}

#[cfg(test)]
mod logger_tests {
    use super::*;
    use crate::server::OpKind;

    fn test_op(tag: &str) -> Op {
        Op::cell(OpKind::Put, "row", "col", tag, "", format!("req-{}", tag), "-")
    }

    async fn fresh_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/paxkv-test-logger-{}", name));
        let _ = fs::remove_dir_all(&dir).await;
        dir
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn append_then_recover() -> Result<(), PaxkvError> {
        let dir = fresh_dir("roundtrip").await;
        let mut logger = OpLogger::new_and_setup(0, &dir, true).await?;
        assert!(!logger.recoverable());
        assert_eq!(logger.recover_global_seq().await?, None);

        logger.append(&test_op("a"), 0).await?;
        logger.append(&test_op("b"), 1).await?;
        logger.append(&test_op("c"), 2).await?;

        // a freshly opened logger sees all three and replays in order
        let mut logger = OpLogger::new_and_setup(0, &dir, true).await?;
        assert!(logger.recoverable());
        assert_eq!(logger.recover_global_seq().await?, Some(2));
        let mut replayed = Vec::new();
        while logger.has_next_op() {
            replayed.push(logger.recover_op().await?);
        }
        assert_eq!(
            replayed,
            vec![test_op("a"), test_op("b"), test_op("c")]
        );

        // appends continue at the next index
        logger.append(&test_op("d"), 3).await?;
        assert!(fs::try_exists(dir.join("3.log")).await?);
        assert_eq!(
            fs::read_to_string(dir.join(GLOBAL_SEQ_STATE)).await?,
            "3"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn state_file_tracks_last_applied_slot() -> Result<(), PaxkvError> {
        let dir = fresh_dir("state").await;
        let mut logger = OpLogger::new_and_setup(0, &dir, false).await?;
        for seq in 0..10 {
            logger.append(&test_op(&format!("{}", seq)), seq).await?;
        }
        assert_eq!(
            fs::read_to_string(dir.join(GLOBAL_SEQ_STATE)).await?,
            "9"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn corrupt_log_file_is_an_error() -> Result<(), PaxkvError> {
        let dir = fresh_dir("corrupt").await;
        let mut logger = OpLogger::new_and_setup(0, &dir, false).await?;
        logger.append(&test_op("fine"), 0).await?;
        fs::write(dir.join("0.log"), b"not an op").await?;

        let mut logger = OpLogger::new_and_setup(0, &dir, false).await?;
        assert!(logger.recoverable());
        assert!(logger.recover_op().await.is_err());
        Ok(())
    }
}
