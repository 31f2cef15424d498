//! Write-behind decorator: mutations are queued to a writer thread and
//! applied to the wrapped engine in the background.
//!
//! Queued values stay readable from a pending table until the writer has
//! applied them, so callers always read their own writes. Errors raised by
//! the writer are kept and returned by the next `flush`, `commit` or `close`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::AsyncWriteConfig;
use crate::engine::{CasCheck, Engine, Recid, check_writable};
use crate::error::{StoreError, StoreResult};

/// Writes applied per batch before the writer checks for new commands.
const MAX_BATCH: usize = 64;

#[derive(Debug, Clone)]
enum Change {
    Write(Vec<u8>),
    Delete,
}

enum WriterCommand {
    Apply { recid: Recid, seq: u64, change: Change },
    Flush(Sender<StoreResult<()>>),
    Shutdown,
}

/// State shared with the writer thread.
#[derive(Default)]
struct Shared {
    /// Latest queued change per recid, tagged with its sequence number.
    pending: Mutex<HashMap<Recid, (u64, Change)>>,
    /// First error the writer hit since the last flush.
    error: Mutex<Option<StoreError>>,
}

impl Shared {
    fn take_error(&self) -> StoreResult<()> {
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct AsyncWriteEngine {
    inner: Arc<dyn Engine>,
    shared: Arc<Shared>,
    sender: Sender<WriterCommand>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl AsyncWriteEngine {
    /// Wrap `inner` and start the writer thread.
    pub fn new(inner: Arc<dyn Engine>, config: &AsyncWriteConfig) -> StoreResult<Self> {
        let (sender, receiver) = bounded::<WriterCommand>(config.queue_size);
        let shared = Arc::new(Shared::default());
        let interval = Duration::from_millis(config.flush_interval_ms);

        let handle = {
            let inner = Arc::clone(&inner);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("recstore-writer".into())
                .spawn(move || Self::writer_loop(inner.as_ref(), &shared, receiver, interval))?
        };
        debug!(queue_size = config.queue_size, "Started write-behind thread");

        Ok(Self {
            inner,
            shared,
            sender,
            writer_handle: Mutex::new(Some(handle)),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn writer_loop(
        engine: &dyn Engine,
        shared: &Shared,
        receiver: Receiver<WriterCommand>,
        interval: Duration,
    ) {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        loop {
            match receiver.recv_timeout(interval) {
                Ok(WriterCommand::Apply { recid, seq, change }) => {
                    batch.push((recid, seq, change));
                    if batch.len() >= MAX_BATCH {
                        Self::apply(engine, shared, &mut batch);
                    }
                }
                Ok(WriterCommand::Flush(reply)) => {
                    Self::apply(engine, shared, &mut batch);
                    let _ = reply.send(shared.take_error());
                }
                Ok(WriterCommand::Shutdown) => {
                    Self::apply(engine, shared, &mut batch);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    Self::apply(engine, shared, &mut batch);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Self::apply(engine, shared, &mut batch);
                    break;
                }
            }
        }
        trace!("Write-behind thread stopped");
    }

    fn apply(engine: &dyn Engine, shared: &Shared, batch: &mut Vec<(Recid, u64, Change)>) {
        for (recid, seq, change) in batch.drain(..) {
            let result = match &change {
                Change::Write(data) => engine.update_bytes(recid, data),
                Change::Delete => engine.delete(recid),
            };
            if let Err(e) = result {
                warn!(recid, error = %e, "Background write failed");
                shared.error.lock().get_or_insert(e);
            }

            let mut pending = shared.pending.lock();
            if pending.get(&recid).is_some_and(|(queued, _)| *queued == seq) {
                pending.remove(&recid);
            }
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn send(&self, command: WriterCommand) -> StoreResult<()> {
        self.sender
            .send(command)
            .map_err(|_| StoreError::Io(std::io::Error::other("write-behind thread died")))
    }

    fn enqueue(&self, recid: Recid, change: Change) -> StoreResult<()> {
        check_writable(self.closed.load(Ordering::Acquire), self.inner.is_read_only())?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        // Pending entry first, so a read racing the writer never misses it.
        self.shared
            .pending
            .lock()
            .insert(recid, (seq, change.clone()));
        self.send(WriterCommand::Apply { recid, seq, change })
    }

    /// Wait until every queued change is applied; returns the first error the
    /// writer hit since the previous flush.
    pub fn flush(&self) -> StoreResult<()> {
        self.check_open()?;
        let (tx, rx) = bounded(1);
        self.send(WriterCommand::Flush(tx))?;
        rx.recv()
            .map_err(|_| StoreError::Io(std::io::Error::other("write-behind thread died")))?
    }

    /// Number of changes not yet applied to the wrapped engine.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn inner(&self) -> &Arc<dyn Engine> {
        &self.inner
    }
}

impl Engine for AsyncWriteEngine {
    fn put_bytes(&self, data: &[u8]) -> StoreResult<Recid> {
        check_writable(self.closed.load(Ordering::Acquire), self.inner.is_read_only())?;
        let recid = self.inner.preallocate()?;
        self.enqueue(recid, Change::Write(data.to_vec()))?;
        Ok(recid)
    }

    fn get_bytes(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some((_, change)) = self.shared.pending.lock().get(&recid) {
            return Ok(match change {
                Change::Write(data) => Some(data.clone()),
                Change::Delete => None,
            });
        }
        self.inner.get_bytes(recid)
    }

    fn update_bytes(&self, recid: Recid, data: &[u8]) -> StoreResult<()> {
        self.enqueue(recid, Change::Write(data.to_vec()))
    }

    fn compare_and_swap_bytes(
        &self,
        recid: Recid,
        check: CasCheck<'_>,
        data: &[u8],
    ) -> StoreResult<bool> {
        self.flush()?;
        self.inner.compare_and_swap_bytes(recid, check, data)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.enqueue(recid, Change::Delete)
    }

    fn preallocate(&self) -> StoreResult<Recid> {
        self.check_open()?;
        self.inner.preallocate()
    }

    fn commit(&self) -> StoreResult<()> {
        self.flush()?;
        self.inner.commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.flush()?;
        self.inner.rollback()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Some(handle) = self.writer_handle.lock().take()
            && handle.join().is_err()
        {
            return Err(StoreError::Io(std::io::Error::other(
                "write-behind thread panicked",
            )));
        }
        let drained = self.shared.take_error();
        self.inner.close()?;
        drained
    }

    fn can_rollback(&self) -> bool {
        self.inner.can_rollback()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for AsyncWriteEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close write-behind engine");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineExt, RECID_FIRST};
    use crate::serializer::StringSerializer;
    use crate::store::StoreWal;
    use pretty_assertions::assert_eq;

    fn engine() -> (Arc<dyn Engine>, AsyncWriteEngine) {
        let inner: Arc<dyn Engine> = Arc::new(StoreWal::memory().unwrap());
        let config = AsyncWriteConfig {
            queue_size: 8,
            flush_interval_ms: 5,
        };
        let engine = AsyncWriteEngine::new(Arc::clone(&inner), &config).unwrap();
        (inner, engine)
    }

    #[test]
    fn test_reads_own_writes() {
        let (inner, engine) = engine();
        let recid = engine.put(&"queued".to_string(), &StringSerializer).unwrap();
        assert_eq!(recid, RECID_FIRST);
        assert_eq!(
            engine.get(recid, &StringSerializer).unwrap().as_deref(),
            Some("queued")
        );

        engine.flush().unwrap();
        assert_eq!(engine.pending(), 0);
        assert_eq!(
            inner.get(recid, &StringSerializer).unwrap().as_deref(),
            Some("queued")
        );
    }

    #[test]
    fn test_many_writes_through_small_queue() {
        let (inner, engine) = engine();
        let recids: Vec<Recid> = (0..200u32)
            .map(|i| engine.put_bytes(&i.to_be_bytes()).unwrap())
            .collect();
        engine.commit().unwrap();
        for (i, recid) in recids.iter().enumerate() {
            assert_eq!(inner.get_bytes(*recid).unwrap().unwrap(), (i as u32).to_be_bytes());
        }
    }

    #[test]
    fn test_last_write_wins() {
        let (_inner, engine) = engine();
        let recid = engine.put_bytes(b"one").unwrap();
        engine.update_bytes(recid, b"two").unwrap();
        engine.update_bytes(recid, b"three").unwrap();
        assert_eq!(engine.get_bytes(recid).unwrap().unwrap(), b"three");
        engine.commit().unwrap();
        assert_eq!(engine.get_bytes(recid).unwrap().unwrap(), b"three");

        engine.delete(recid).unwrap();
        assert_eq!(engine.get_bytes(recid).unwrap(), None);
        engine.commit().unwrap();
        assert_eq!(engine.get_bytes(recid).unwrap(), None);
    }

    #[test]
    fn test_errors_surface_on_commit() {
        let (_inner, engine) = engine();
        let recid = engine.put_bytes(b"x").unwrap();
        engine.delete(recid).unwrap();
        engine.delete(recid).unwrap();
        assert!(matches!(engine.commit(), Err(StoreError::AlreadyDeleted(r)) if r == recid));
        // reported once
        engine.commit().unwrap();
    }

    #[test]
    fn test_cas_sees_queued_writes() {
        let (_inner, engine) = engine();
        let s = StringSerializer;
        let recid = engine.put(&"a".to_string(), &s).unwrap();
        assert!(engine
            .compare_and_swap(recid, Some(&"a".to_string()), &"b".to_string(), &s)
            .unwrap());
        assert!(!engine
            .compare_and_swap(recid, Some(&"a".to_string()), &"c".to_string(), &s)
            .unwrap());
        assert_eq!(engine.get(recid, &s).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_close_drains_queue() {
        let (inner, engine) = engine();
        engine.put_bytes(b"drained").unwrap();
        engine.close().unwrap();
        assert_eq!(engine.pending(), 0);
        assert!(engine.is_closed());
        assert!(inner.is_closed());
        assert!(matches!(engine.put_bytes(b"late"), Err(StoreError::Closed)));
    }
}
