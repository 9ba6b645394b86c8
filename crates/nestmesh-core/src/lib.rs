//! Bootstrap core for a nested remote-execution fabric.
//!
//! A process that loads this crate can authenticate and frame messages
//! over an arbitrary byte-stream transport, route them among a tree of
//! integer-addressed contexts, multiplex I/O on a single broker thread
//! while user code runs freely on others, serve remote module imports
//! back toward the tree root, and dispatch remote function calls.

pub mod broker;
pub mod call_dispatch;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod external_context;
pub mod importer;
pub mod io_logger;
pub mod log_handler;
pub mod message;
pub mod router;
pub mod side;
pub mod stream;

pub use broker::{Broker, BrokerHandle, BrokerSource};
pub use call_dispatch::CallDispatcher;
pub use channel::Channel;
pub use config::BootArgs;
pub use context::Context;
pub use error::{NestmeshError, Result};
pub use external_context::ExternalContext;
pub use importer::{Importer, LocalResolver, ModuleInstaller};
pub use message::Message;
pub use router::Router;
pub use side::Side;
pub use stream::Stream;
