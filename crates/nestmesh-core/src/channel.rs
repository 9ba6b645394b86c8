//! A handle-scoped FIFO queue of deliveries (spec.md §4.6, "Channel").
//!
//! A `Channel` registers a handler on a [`Context`] that pushes every
//! message addressed to its handle into an `mpsc` queue, so callers can
//! `get` them synchronously without writing their own handler.

use crate::context::Context;
use crate::error::{NestmeshError, Result};
use crate::message::Message;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Channel {
    context: Arc<Context>,
    handle: u32,
    rx: Mutex<Receiver<Message>>,
    closed: Mutex<bool>,
}

impl Channel {
    /// Registers a persistent handler on `context` and returns the
    /// `Channel` that drains it. Pass `handle` to bind an existing
    /// reserved handle (e.g. `FORWARD_LOG`), or `None` to allocate one.
    pub fn new(context: &Arc<Context>, handle: Option<u32>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = context.add_handler(move |msg| { let _ = tx.send(msg.clone()); }, handle, true);
        Arc::new(Self { context: context.clone(), handle, rx: Mutex::new(rx), closed: Mutex::new(false) })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Sends `data` to the peer context on this channel's handle.
    pub fn put(&self, data: Vec<u8>) {
        self.context.send(self.handle, 0, data);
    }

    /// Blocks for the next delivery, or up to `timeout` if given. Returns
    /// `Ok(None)` once a `_DEAD` marks the channel closed.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        if *self.closed.lock().unwrap() {
            return Ok(None);
        }
        let rx = self.rx.lock().unwrap();
        let msg = match timeout {
            Some(d) => rx.recv_timeout(d).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => NestmeshError::Timeout,
                mpsc::RecvTimeoutError::Disconnected => NestmeshError::ChannelClosed { handle: self.handle },
            })?,
            None => rx.recv().map_err(|_| NestmeshError::ChannelClosed { handle: self.handle })?,
        };
        if msg.is_dead() {
            *self.closed.lock().unwrap() = true;
            return Ok(None);
        }
        Ok(Some(msg))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    /// Iterates deliveries until the channel closes, blocking between
    /// items. Mirrors the blocking-iterator style of a queue consumer.
    pub fn iter(self: &Arc<Self>) -> ChannelIter {
        ChannelIter { channel: self.clone() }
    }
}

pub struct ChannelIter {
    channel: Arc<Channel>,
}

impl Iterator for ChannelIter {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.channel.get(None).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::router::Router;

    #[test]
    fn put_then_get_round_trips_a_payload() {
        let broker = Broker::spawn().unwrap();
        let router = Router::new(1, broker.handle());
        let ctx = Context::new(2, 1, "peer", &router);
        let channel = Channel::new(&ctx, None);

        let handle = channel.handle();
        let router2 = router.clone();
        router2.route(Message::new(1, 2, handle, 0, b"payload".to_vec()));

        let msg = channel.get(Some(Duration::from_secs(1))).unwrap().expect("delivery");
        assert_eq!(msg.data, b"payload");
        broker.join();
    }

    #[test]
    fn dead_marker_closes_the_channel() {
        let broker = Broker::spawn().unwrap();
        let router = Router::new(1, broker.handle());
        let ctx = Context::new(2, 1, "peer", &router);
        let channel = Channel::new(&ctx, None);

        let handle = channel.handle();
        router.route(Message::dead(1, 2, handle));

        let result = channel.get(Some(Duration::from_secs(1))).unwrap();
        assert!(result.is_none());
        assert!(channel.is_closed());
        broker.join();
    }
}
