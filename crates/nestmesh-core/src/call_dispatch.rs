//! Dispatches remote function-call requests (spec.md §1(e), §4's
//! `CALL_FUNCTION` reserved handle, §6). Grounded on
//! `original_source/econtext/core.py`'s `ExternalContext._dispatch_calls`:
//! drain a `Channel` bound to `CALL_FUNCTION`, decode each request,
//! invoke it, and reply with the return value or a `CallError` on
//! `msg.reply_to`.
//!
//! Rust has no `__import__`/`getattr` to resolve `(module, class, func)`
//! dynamically, so that step is a pluggable trait — the same shape as
//! `Importer`'s `LocalResolver`/`ModuleInstaller` split.

use crate::channel::Channel;
use crate::context::Context;
use crate::message::{decode, encode, CallError, CallMessage, CallResult, CALL_FUNCTION};
use std::sync::Arc;
use std::thread;

/// Resolves and invokes `(module, class, func)` against whatever the
/// host program registers. Returns the opaque encoded return value, or
/// an error description to report back as a `CallError`.
pub trait CallDispatcher: Send + Sync {
    fn dispatch(&self, call: &CallMessage) -> std::result::Result<Vec<u8>, String>;
}

/// Spawns the dispatch loop on its own thread, bound to `context`'s
/// `CALL_FUNCTION` handle. The loop exits once the channel closes (the
/// context's `on_shutdown` delivers `_DEAD` to it).
pub fn spawn_call_dispatch_loop(context: Arc<Context>, dispatcher: Arc<dyn CallDispatcher>) -> thread::JoinHandle<()> {
    let channel = Channel::new(&context, Some(CALL_FUNCTION));
    thread::Builder::new()
        .name("nestmesh-call-dispatch".into())
        .spawn(move || dispatch_loop(&context, &channel, dispatcher.as_ref()))
        .expect("failed to spawn call dispatch thread")
}

fn dispatch_loop(context: &Arc<Context>, channel: &Arc<Channel>, dispatcher: &dyn CallDispatcher) {
    loop {
        let msg = match channel.get(None) {
            Ok(Some(msg)) => msg,
            Ok(None) | Err(_) => return,
        };
        let reply_to = msg.reply_to;

        let result = match decode::<CallMessage>(&msg.data) {
            Ok(call) => match dispatcher.dispatch(&call) {
                Ok(value) => CallResult::Ok(value),
                Err(traceback) => CallResult::Err(CallError { traceback }),
            },
            Err(err) => CallResult::Err(CallError { traceback: err.to_string() }),
        };

        match encode(&result) {
            Ok(bytes) => context.send(reply_to, 0, bytes),
            Err(err) => tracing::error!("failed to encode call result: {err}"),
        }
    }
}
