//! A remote peer identity plus its local handle table (spec.md §4.5).

use crate::broker::BrokerHandle;
use crate::error::{NestmeshError, Result};
use crate::message::{Message, FIRST_USER_HANDLE};
use crate::router::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

struct HandlerEntry {
    persist: bool,
    callback: Box<dyn FnMut(&Message) + Send>,
}

pub struct Context {
    context_id: u32,
    this_process_id: u32,
    name: String,
    router: Weak<Router>,
    broker: BrokerHandle,
    handle_map: Mutex<HashMap<u32, HandlerEntry>>,
    next_handle: AtomicU32,
}

impl Context {
    pub fn new(context_id: u32, this_process_id: u32, name: impl Into<String>, router: &Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            context_id,
            this_process_id,
            name: name.into(),
            router: Arc::downgrade(router),
            broker: router.broker().clone(),
            handle_map: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(FIRST_USER_HANDLE),
        })
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `callback` under `handle` (or a freshly allocated one),
    /// hopping through the broker thread since the handle table is only
    /// safe to mutate there (spec.md §4.5, §5).
    pub fn add_handler(
        self: &Arc<Self>,
        callback: impl FnMut(&Message) + Send + 'static,
        handle: Option<u32>,
        persist: bool,
    ) -> u32 {
        let handle = handle.unwrap_or_else(|| self.next_handle.fetch_add(1, Ordering::SeqCst));
        let context = self.clone();
        let boxed: Box<dyn FnMut(&Message) + Send> = Box::new(callback);
        context.broker.clone().on_thread(move |_| {
            context.handle_map.lock().unwrap().insert(handle, HandlerEntry { persist, callback: boxed });
        });
        handle
    }

    /// Dispatches `msg` to its registered handler. Must run on the
    /// broker thread (spec.md §4.5, "Callbacks run on the broker thread").
    pub(crate) fn invoke(&self, msg: Message) {
        let entry = self.handle_map.lock().unwrap().remove(&msg.handle);
        let Some(mut entry) = entry else {
            tracing::warn!(handle = msg.handle, "dropping message: unknown handle");
            return;
        };
        let persist = entry.persist;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (entry.callback)(&msg)));
        if result.is_err() {
            tracing::error!(handle = msg.handle, "handler panicked; handle table left intact");
        }
        if persist {
            self.handle_map.lock().unwrap().entry(msg.handle).or_insert(entry);
        }
    }

    /// Stamps `dst_id`/`src_id` and submits through the router.
    pub fn send(&self, handle: u32, reply_to: u32, data: Vec<u8>) {
        let msg = Message::new(self.context_id, self.this_process_id, handle, reply_to, data);
        match self.router.upgrade() {
            Some(router) => router.route(msg),
            None => tracing::warn!("context has no router; message dropped"),
        }
    }

    /// Synchronous request/reply. Illegal from the broker thread, where
    /// it would self-deadlock (spec.md §4.5, §8 property 7).
    pub fn send_await(self: &Arc<Self>, handle: u32, data: Vec<u8>, deadline: Option<Duration>) -> Result<Message> {
        if BrokerHandle::is_broker_thread() {
            return Err(NestmeshError::BrokerThreadSelfAwait);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let reply_handle = self.add_handler(move |msg| { let _ = tx.send(msg.clone()); }, None, false);
        self.send(handle, reply_handle, data);

        let reply = match deadline {
            Some(d) => rx.recv_timeout(d).map_err(|_| NestmeshError::Timeout)?,
            None => rx.recv().map_err(|_| NestmeshError::Timeout)?,
        };
        if reply.is_dead() {
            return Err(NestmeshError::stream(self.context_id, "peer disappeared while awaiting reply"));
        }
        Ok(reply)
    }

    /// Unblocks every still-registered handler with a synthetic `_DEAD`
    /// delivery (spec.md §4.5, "on_shutdown").
    pub(crate) fn on_shutdown(&self) {
        let entries: Vec<(u32, HandlerEntry)> = self.handle_map.lock().unwrap().drain().collect();
        for (handle, mut entry) in entries {
            let dead = Message::dead(self.this_process_id, self.context_id, handle);
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (entry.callback)(&dead)));
        }
    }
}
