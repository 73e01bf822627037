use crate::cluster::{AllocationId, ClusterClient};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

#[derive(Default)]
struct Queue {
    due: BinaryHeap<Reverse<(Instant, AllocationId)>>,
    stopped: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Periodic wake scheduler for status queries.
///
/// Every scheduled allocation is queried once after `interval`, the node
/// handler reschedules it for as long as the process is alive.
pub struct StatusPoller {
    inner: Arc<Inner>,
    interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPoller {
    pub fn start(cluster: Arc<dyn ClusterClient>, interval: Duration) -> Result<Self, io::Error> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });

        let thread = {
            let inner = inner.clone();

            thread::Builder::new()
                .name(String::from("status-poller"))
                .spawn(move || poll_loop(&inner, cluster.as_ref()))?
        };

        Ok(Self {
            inner,
            interval,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// query the allocation's status once the interval has passed
    pub fn schedule(&self, id: AllocationId) {
        let mut queue = self.inner.queue.lock();

        if queue.stopped {
            return;
        }

        trace!(allocation = %id, "Scheduling status query");
        queue.due.push(Reverse((Instant::now() + self.interval, id)));
        self.inner.wake.notify_one();
    }

    /// number of queries still waiting
    #[cfg(test)]
    pub fn scheduled(&self) -> usize {
        self.inner.queue.lock().due.len()
    }

    pub fn stop(&self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.stopped = true;
            queue.due.clear();
            self.inner.wake.notify_all();
        }

        if let Some(thread) = self.thread.lock().take() {
            // the cluster may stop the poller from inside a status callback
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(inner: &Inner, cluster: &dyn ClusterClient) {
    let mut queue = inner.queue.lock();

    while !queue.stopped {
        let next = queue.due.peek().map(|Reverse((due, _))| *due);

        match next {
            None => inner.wake.wait(&mut queue),
            Some(due) if due <= Instant::now() => {
                let id = queue.due.pop().map(|Reverse((_, id))| id);

                if let Some(id) = id {
                    drop(queue);
                    cluster.query_status(&id);
                    queue = inner.queue.lock();
                }
            }
            Some(due) => {
                inner.wake.wait_until(&mut queue, due);
            }
        }
    }

    debug!("Status poller stopped");
}
