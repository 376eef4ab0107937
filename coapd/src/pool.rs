//! Process-wide message pool.
//!
//! Short-lived protocol replies (ACKs, 2.31 Continues, error responses)
//! are built in pooled [`Message`] objects so the option container
//! allocation is reused across exchanges. Released messages are reset
//! before they re-enter the pool; a message that is still borrowed simply
//! drops and the pool refills lazily.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use coapd_msg::{Code, Message, MessageType};
use once_cell::sync::Lazy;

/// Idle messages kept per process; excess releases are dropped.
const MAX_IDLE: usize = 256;

static POOL: Lazy<MessagePool> = Lazy::new(MessagePool::new);

/// Pool of reusable [`Message`] objects with internal synchronisation.
pub struct MessagePool {
    idle: Mutex<Vec<Message>>,
}

impl MessagePool {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    fn acquire_from(&'static self) -> PooledMessage {
        let msg = self
            .idle
            .lock()
            .expect("pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| Message::new(MessageType::Confirmable, Code::EMPTY, 0));
        PooledMessage {
            msg: Some(msg),
            pool: self,
        }
    }

    fn release(&self, mut msg: Message) {
        msg.reset_for_reuse();
        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        if idle.len() < MAX_IDLE {
            idle.push(msg);
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// Acquire a message from the process-wide pool.
pub fn acquire() -> PooledMessage {
    POOL.acquire_from()
}

/// A pooled message; returns to the pool on drop, reset.
pub struct PooledMessage {
    msg: Option<Message>,
    pool: &'static MessagePool,
}

impl PooledMessage {
    /// Detach the message from the pool, e.g. to hand it to a handler
    /// that outlives the scope.
    pub fn into_inner(mut self) -> Message {
        self.msg.take().expect("message present until drop")
    }
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        self.msg.as_ref().expect("message present until drop")
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        self.msg.as_mut().expect("message present until drop")
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            self.pool.release(msg);
        }
    }
}
