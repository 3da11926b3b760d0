//! Per-connection delivery buffer.
//!
//! The fan-out task pushes into an `Outbox` without ever waiting on the
//! socket; the connection's writer task drains it. When the buffer is full the
//! oldest queued update is discarded (at-most-once, newest-wins). Control
//! messages such as subscribe acknowledgements are never discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tungstenite::protocol::Message as WsMessage;

#[derive(Debug)]
enum Outbound {
    Control(WsMessage),
    Update(WsMessage),
}

impl Outbound {
    fn is_update(&self) -> bool {
        matches!(self, Outbound::Update(_))
    }

    fn into_message(self) -> WsMessage {
        match self {
            Outbound::Control(msg) | Outbound::Update(msg) => msg,
        }
    }
}

#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a message that must not be dropped. Returns `false` once closed.
    pub fn push_control(&self, msg: WsMessage) -> bool {
        self.push(Outbound::Control(msg))
    }

    /// Queues a data update, evicting the oldest update when full.
    pub fn push_update(&self, msg: WsMessage) -> bool {
        self.push(Outbound::Update(msg))
    }

    fn push(&self, item: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if item.is_update() && queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(Outbound::is_update) {
                    queue.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next message. Returns `None` once closed and drained.
    ///
    /// Single consumer: `notify_one` keeps a permit when nobody is waiting,
    /// so a push between the empty check and the await is not lost.
    pub async fn recv(&self) -> Option<WsMessage> {
        loop {
            if let Some(item) = self.queue.lock().pop_front() {
                return Some(item.into_message());
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of updates discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
