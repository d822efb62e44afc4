use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::physical::{PhysicalConnection, WriteOutcome};

type ScheduleRx = Arc<AsyncMutex<mpsc::UnboundedReceiver<Arc<PhysicalConnection>>>>;

/// Fixed set of workers that drain connection queues onto sockets.
///
/// A connection sits in the run queue at most once; its `scheduled` flag
/// is claimed before sending and cleared by the worker after a pass.
pub struct WriterPool {
    tx: mpsc::UnboundedSender<Arc<PhysicalConnection>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriterPool {
    pub fn new(workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: ScheduleRx = Arc::new(AsyncMutex::new(rx));
        let shutdown = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    rx.clone(),
                    tx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        debug!(workers = workers.max(1), "writer pool started");
        Arc::new(Self {
            tx,
            shutdown,
            workers: Mutex::new(handles),
        })
    }

    /// Ask a worker to drain `conn`. No-op if it is already scheduled.
    pub fn schedule(&self, conn: &Arc<PhysicalConnection>) {
        if !conn.try_schedule() {
            return;
        }
        if self.tx.send(conn.clone()).is_err() {
            conn.clear_scheduled();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.workers.lock().clear();
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    index: usize,
    rx: ScheduleRx,
    tx: mpsc::UnboundedSender<Arc<PhysicalConnection>>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = {
            let mut guard = tokio::select! {
                _ = shutdown.cancelled() => break,
                guard = rx.lock() => guard,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                conn = guard.recv() => match conn {
                    Some(conn) => conn,
                    None => break,
                },
            }
        };

        let outcome = conn.write_pending().await;
        trace!(worker = index, connection = conn.id(), ?outcome, "writer pass");
        conn.clear_scheduled();
        let again = match outcome {
            WriteOutcome::MoreWork(_) | WriteOutcome::Busy => true,
            WriteOutcome::Failed => false,
            WriteOutcome::Idle | WriteOutcome::Flushed(_) => conn.has_queued(),
        };
        if again && conn.try_schedule() && tx.send(conn.clone()).is_err() {
            conn.clear_scheduled();
        }
        if outcome == WriteOutcome::Busy {
            tokio::task::yield_now().await;
        }
    }
    debug!(worker = index, "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::physical::{ConnectionObserver, ConnectionOptions, ConnectionPurpose};
    use crate::error::{ConnectionContext, MuxError};
    use crate::protocol::redis::{Command, Message, RespCodec};
    use bytes::BytesMut;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::broadcast;
    use tokio_util::codec::Decoder;

    struct Quiet;

    impl ConnectionObserver for Quiet {
        fn on_connection_failed(&self, _connection_id: u64, _error: &MuxError) {}
    }

    fn connection(
        client: tokio::io::DuplexStream,
        observer: &Arc<Quiet>,
        options: ConnectionOptions,
    ) -> Arc<PhysicalConnection> {
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(observer) as Weak<dyn ConnectionObserver>;
        let (pushes, _) = broadcast::channel(4);
        PhysicalConnection::start(
            Arc::from("test:1"),
            ConnectionPurpose::Interactive,
            Box::new(client),
            options,
            weak,
            pushes,
        )
    }

    async fn count_frames(server: &mut tokio::io::DuplexStream, want: usize) -> usize {
        let mut buf = BytesMut::new();
        let mut codec = RespCodec::new();
        let mut seen = 0;
        while seen < want {
            server.read_buf(&mut buf).await.unwrap();
            while codec.decode(&mut buf).unwrap().is_some() {
                seen += 1;
            }
        }
        seen
    }

    #[tokio::test]
    async fn drains_past_the_per_pass_cap() {
        let (client, mut server) = duplex(64 * 1024);
        let observer = Arc::new(Quiet);
        let options = ConnectionOptions {
            max_work: 1,
            ..ConnectionOptions::default()
        };
        let conn = connection(client, &observer, options);
        let pool = WriterPool::new(2);
        assert_eq!(pool.worker_count(), 2);
        for key in ["a", "b", "c", "d"] {
            conn.enqueue(Message::builder(Command::Get).key(key).build())
                .unwrap();
        }
        pool.schedule(&conn);

        let seen = tokio::time::timeout(Duration::from_secs(5), count_frames(&mut server, 4))
            .await
            .expect("all frames written");
        assert_eq!(seen, 4);
        pool.shutdown();
    }

    #[tokio::test]
    async fn failing_a_stalled_connection_frees_its_worker() {
        let observer = Arc::new(Quiet);
        // The peer never reads, so the write parks once the pipe is full.
        let (stalled_client, _stalled_server) = duplex(64);
        let stalled = connection(stalled_client, &observer, ConnectionOptions::default());
        let (client, mut server) = duplex(64 * 1024);
        let healthy = connection(client, &observer, ConnectionOptions::default());
        let pool = WriterPool::new(1);

        stalled
            .enqueue(
                Message::builder(Command::Set)
                    .key("big")
                    .value(vec![b'x'; 4096])
                    .build(),
            )
            .unwrap();
        pool.schedule(&stalled);
        tokio::time::sleep(Duration::from_millis(50)).await;

        stalled.fail(MuxError::socket("peer stopped reading", ConnectionContext::default()));
        healthy
            .enqueue(Message::builder(Command::Get).key("k").build())
            .unwrap();
        pool.schedule(&healthy);

        let seen = tokio::time::timeout(Duration::from_secs(3), count_frames(&mut server, 1))
            .await
            .expect("the only worker moved on");
        assert_eq!(seen, 1);
        assert!(stalled.is_failed());
        pool.shutdown();
    }
}
