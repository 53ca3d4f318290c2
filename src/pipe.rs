//! Named-pipe broadcaster
//!
//! Best-effort fanout of the event stream to pipe subscribers. The fanout
//! core ([`Fanout`]) is transport-neutral: each subscriber is a bounded queue
//! drained by its own writer thread into a [`WriteSink`]. Broadcast never
//! blocks on a slow subscriber; a queue that stays full past the send timeout
//! gets its subscriber evicted, as does a subscriber whose sink fails. The
//! Windows half ([`PipeBroadcaster`]) serves the per-volume local pipe
//! `\\.\pipe\usn-watcher-<LETTER>` and plugs pipe writes in as the sink.

use crate::error::Result;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lines buffered per subscriber before sends start timing out.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// How long one subscriber may stall a broadcast before eviction.
const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Writes one line's bytes to a subscriber's transport.
pub type WriteSink = Box<dyn FnMut(&[u8]) -> Result<()> + Send>;

struct Subscriber {
    id: u64,
    tx: Sender<Arc<str>>,
}

/// Subscriber registry and line fanout, decoupled from the pipe transport.
pub struct Fanout {
    queue_depth: usize,
    send_timeout: Duration,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::with_limits(SUBSCRIBER_QUEUE_DEPTH, SUBSCRIBER_SEND_TIMEOUT)
    }

    /// Fanout with explicit queue and timeout limits.
    pub fn with_limits(queue_depth: usize, send_timeout: Duration) -> Self {
        Self {
            queue_depth,
            send_timeout,
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber: its own writer thread drains a bounded queue
    /// into `sink`. A failed sink write drops the subscriber. Returns the
    /// subscriber id.
    pub fn attach(fanout: &Arc<Self>, mut sink: WriteSink) -> u64 {
        let id = fanout.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Arc<str>>(fanout.queue_depth);

        let writer_fanout = Arc::clone(fanout);
        let writer = thread::spawn(move || {
            while let Ok(line) = rx.recv() {
                if let Err(e) = sink(line.as_bytes()) {
                    tracing::debug!(subscriber = id, error = %e, "subscriber write failed, dropping");
                    break;
                }
            }
            writer_fanout.evict(id);
        });

        fanout.subscribers.lock().push(Subscriber { id, tx });
        fanout.writers.lock().push(writer);
        tracing::info!(subscriber = id, "pipe subscriber connected");
        id
    }

    /// Queue one NDJSON line (newline appended) to every subscriber.
    ///
    /// The sender list is snapshotted under the lock; sends happen outside
    /// it. Subscribers whose queue stays full past the timeout are evicted.
    pub fn broadcast(&self, line: &str) {
        let payload: Arc<str> = format!("{}\n", line).into();

        let snapshot: Vec<(u64, Sender<Arc<str>>)> = {
            let subscribers = self.subscribers.lock();
            subscribers.iter().map(|s| (s.id, s.tx.clone())).collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let mut evicted = Vec::new();
        for (id, tx) in snapshot {
            if tx
                .send_timeout(Arc::clone(&payload), self.send_timeout)
                .is_err()
            {
                evicted.push(id);
            }
        }

        for id in evicted {
            tracing::info!(subscriber = id, "evicting slow pipe subscriber");
            self.evict(id);
        }
    }

    /// Currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every sender (ending each writer's recv loop) and join the
    /// writer threads.
    pub fn shutdown(&self) {
        self.subscribers.lock().clear();
        let writers: Vec<JoinHandle<()>> = self.writers.lock().drain(..).collect();
        for writer in writers {
            let _ = writer.join();
        }
    }

    fn evict(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.id != id);
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
pub use broadcaster::PipeBroadcaster;

#[cfg(windows)]
mod broadcaster {
    use super::Fanout;
    use crate::ntfs::winapi::{
        connect_pipe, create_pipe_instance, disconnect_pipe, open_pipe_client, write_pipe,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    /// Pause before retrying after a failed pipe-instance creation.
    const INSTANCE_RETRY_DELAY: Duration = Duration::from_millis(500);

    /// Accept loop plus per-subscriber fanout for one volume's event pipe.
    pub struct PipeBroadcaster {
        fanout: Arc<Fanout>,
        pipe_name: String,
        running: Arc<AtomicBool>,
        acceptor: Option<JoinHandle<()>>,
    }

    impl PipeBroadcaster {
        /// Start serving the pipe for a volume.
        pub fn start(volume: char) -> Self {
            let fanout = Arc::new(Fanout::new());
            let running = Arc::new(AtomicBool::new(true));
            let pipe_name = format!(r"\\.\pipe\usn-watcher-{}", volume);

            let acceptor_fanout = Arc::clone(&fanout);
            let acceptor_running = Arc::clone(&running);
            let acceptor_name = pipe_name.clone();
            let acceptor = thread::spawn(move || {
                while acceptor_running.load(Ordering::Relaxed) {
                    let instance = match create_pipe_instance(&acceptor_name) {
                        Ok(handle) => handle,
                        Err(e) => {
                            tracing::warn!(error = %e, "pipe instance creation failed");
                            thread::sleep(INSTANCE_RETRY_DELAY);
                            continue;
                        }
                    };

                    match connect_pipe(&instance) {
                        Ok(()) => {
                            if !acceptor_running.load(Ordering::Relaxed) {
                                // Shutdown wake-up connection, not a subscriber
                                disconnect_pipe(&instance);
                                break;
                            }
                            // The sink owns the instance; dropping it on
                            // writer exit closes the client's end.
                            Fanout::attach(
                                &acceptor_fanout,
                                Box::new(move |bytes| write_pipe(&instance, bytes)),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "pipe connect failed");
                        }
                    }
                }
            });

            tracing::info!(pipe = %pipe_name, "named pipe serving");
            Self {
                fanout,
                pipe_name,
                running,
                acceptor: Some(acceptor),
            }
        }

        /// Queue one NDJSON line to every connected subscriber.
        pub fn broadcast(&self, line: &str) {
            self.fanout.broadcast(line);
        }

        /// Currently connected subscribers.
        pub fn subscriber_count(&self) -> usize {
            self.fanout.subscriber_count()
        }
    }

    impl Drop for PipeBroadcaster {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Relaxed);

            // Wake the acceptor out of its blocking connect, then join it
            let _ = open_pipe_client(&self.pipe_name);
            if let Some(acceptor) = self.acceptor.take() {
                let _ = acceptor.join();
            }

            self.fanout.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatcherError;
    use std::time::Instant;

    fn wait_until(limit_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(limit_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn broadcast_reaches_attached_subscriber_with_newline() {
        let fanout = Arc::new(Fanout::new());
        let received = Arc::new(Mutex::new(Vec::<String>::new()));

        let sink_target = Arc::clone(&received);
        Fanout::attach(
            &fanout,
            Box::new(move |bytes| {
                sink_target
                    .lock()
                    .push(String::from_utf8_lossy(bytes).into_owned());
                Ok(())
            }),
        );

        fanout.broadcast(r#"{"usn":1}"#);
        assert!(wait_until(1000, || !received.lock().is_empty()));
        assert_eq!(received.lock()[0], "{\"usn\":1}\n");

        fanout.shutdown();
    }

    #[test]
    fn broadcast_fans_out_to_every_subscriber() {
        let fanout = Arc::new(Fanout::new());
        let counts = Arc::new(Mutex::new([0usize; 2]));

        for slot in 0..2usize {
            let sink_counts = Arc::clone(&counts);
            Fanout::attach(
                &fanout,
                Box::new(move |_| {
                    sink_counts.lock()[slot] += 1;
                    Ok(())
                }),
            );
        }
        assert_eq!(fanout.subscriber_count(), 2);

        fanout.broadcast("a");
        fanout.broadcast("b");
        assert!(wait_until(1000, || *counts.lock() == [2, 2]));

        fanout.shutdown();
    }

    #[test]
    fn failing_sink_evicts_its_subscriber() {
        let fanout = Arc::new(Fanout::new());
        Fanout::attach(
            &fanout,
            Box::new(|_| Err(WatcherError::from_win32(232, "pipe closed"))),
        );
        assert_eq!(fanout.subscriber_count(), 1);

        fanout.broadcast("x");
        assert!(wait_until(1000, || fanout.subscriber_count() == 0));

        fanout.shutdown();
    }

    #[test]
    fn slow_subscriber_is_evicted_after_send_timeout() {
        let fanout = Arc::new(Fanout::with_limits(1, Duration::from_millis(50)));

        // The writer stalls on its first line, so the depth-1 queue backs up
        // and a later send times out.
        Fanout::attach(
            &fanout,
            Box::new(|_| {
                thread::sleep(Duration::from_secs(60));
                Ok(())
            }),
        );

        let evicted = wait_until(3000, || {
            fanout.broadcast("x");
            fanout.subscriber_count() == 0
        });
        assert!(evicted);
        // No shutdown here: joining would wait out the stalled writer.
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let fanout = Fanout::new();
        fanout.broadcast("x");
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
