//! Maps context ids to [`Stream`]s and to local [`Context`]s, and decides
//! whether an incoming message is delivered locally or forwarded
//! (spec.md §4.4).

use crate::broker::BrokerHandle;
use crate::context::Context;
use crate::message::{Message, ADD_ROUTE};
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct Router {
    this_process_id: u32,
    stream_by_id: Mutex<HashMap<u32, Arc<Stream>>>,
    context_by_id: Mutex<HashMap<u32, Arc<Context>>>,
    parent_id: Mutex<Option<u32>>,
    broker: BrokerHandle,
}

impl Router {
    pub fn new(this_process_id: u32, broker: BrokerHandle) -> Arc<Self> {
        Arc::new(Self {
            this_process_id,
            stream_by_id: Mutex::new(HashMap::new()),
            context_by_id: Mutex::new(HashMap::new()),
            parent_id: Mutex::new(None),
            broker,
        })
    }

    pub fn this_process_id(&self) -> u32 {
        self.this_process_id
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Records `stream` under `context_id` in the forwarding table and
    /// binds the stream back to this router so it can route frames it
    /// receives. Receiving was already armed in `Stream::accept`.
    pub fn register(self: &Arc<Self>, context_id: u32, stream: Arc<Stream>) {
        stream.bind_router(Arc::downgrade(self));
        self.stream_by_id.lock().unwrap().insert(context_id, stream);
    }

    pub fn register_context(&self, context: Arc<Context>) {
        self.context_by_id.lock().unwrap().insert(context.context_id(), context);
    }

    /// Adopts `context` as the parent and installs the `ADD_ROUTE` (103)
    /// handler that lets the parent teach us routes to cousins.
    pub fn set_parent(self: &Arc<Self>, context: Arc<Context>) {
        let parent_id = context.context_id();
        *self.parent_id.lock().unwrap() = Some(parent_id);
        self.register_context(context.clone());

        let router = self.clone();
        context.add_handler(
            move |msg| router.handle_add_route(msg),
            Some(ADD_ROUTE),
            true,
        );
    }

    fn handle_add_route(&self, msg: &Message) {
        let Ok(text) = std::str::from_utf8(&msg.data) else {
            tracing::warn!("ADD_ROUTE payload was not ASCII");
            return;
        };
        let Some((target, via)) = text.split_once('\0') else {
            tracing::warn!("ADD_ROUTE payload missing separator");
            return;
        };
        let (Ok(target_id), Ok(via_id)) = (target.parse::<u32>(), via.parse::<u32>()) else {
            tracing::warn!("ADD_ROUTE payload was not decimal ids");
            return;
        };
        let via_stream = self.stream_by_id.lock().unwrap().get(&via_id).cloned();
        match via_stream {
            Some(stream) => {
                self.stream_by_id.lock().unwrap().insert(target_id, stream);
            }
            None => tracing::warn!(target_id, via_id, "ADD_ROUTE: unknown via context"),
        }
    }

    /// Always hops through the broker thread before mutating or
    /// inspecting the forwarding table (spec.md §4.4).
    pub fn route(self: &Arc<Self>, msg: Message) {
        let router = self.clone();
        self.broker.on_thread(move |_| router.route_on_broker_thread(msg));
    }

    fn route_on_broker_thread(&self, msg: Message) {
        if msg.dst_id == self.this_process_id {
            let context = self.context_by_id.lock().unwrap().get(&msg.src_id).cloned();
            match context {
                Some(context) => context.invoke(msg),
                None => tracing::warn!(
                    dst = msg.dst_id,
                    src = msg.src_id,
                    handle = msg.handle,
                    "dropping message: no local context for source"
                ),
            }
            return;
        }

        let stream = self.stream_by_id.lock().unwrap().get(&msg.dst_id).cloned();
        match stream {
            Some(stream) => stream.send(msg),
            None => tracing::warn!(dst = msg.dst_id, "dropping message: no route"),
        }
    }

    /// Called by a `Stream` when it disconnects: drops its forwarding
    /// entries and, if it was the parent link, asks the broker to shut
    /// down the whole process (spec.md §4.4).
    pub(crate) fn on_stream_disconnect(&self, remote_id: u32, broker: &BrokerHandle) {
        self.stream_by_id.lock().unwrap().retain(|_, s| s.remote_id() != remote_id);
        if let Some(context) = self.context_by_id.lock().unwrap().remove(&remote_id) {
            context.on_shutdown();
        }
        if *self.parent_id.lock().unwrap() == Some(remote_id) {
            tracing::warn!("parent stream disconnected; shutting down");
            broker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;

    #[test]
    fn unknown_destination_is_dropped_not_queued() {
        let broker = Broker::spawn().unwrap();
        let router = Router::new(1, broker.handle());
        // No stream_by_id/context_by_id entries installed: routing a
        // message to either an unknown remote or an unknown local
        // source must simply drop it (spec.md §9, third Open Question).
        router.route(Message::new(7, 3, 500, 0, vec![]));
        router.route(Message::new(1, 3, 500, 0, vec![]));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(router.stream_by_id.lock().unwrap().is_empty());
        broker.join();
    }
}
