//! Real bootstrap entrypoint: wires the live descriptors a spawning
//! parent hands a child (spec.md §6) and runs until the broker shuts
//! down. Hosting programs embedding `nestmesh-core` as a library will
//! typically call `ExternalContext::main` directly with their own
//! `LocalResolver`/`ModuleInstaller`; this binary exists so the boot
//! path is independently exercisable.

use nestmesh_core::call_dispatch::CallDispatcher;
use nestmesh_core::config::BootArgs;
use nestmesh_core::error::Result;
use nestmesh_core::external_context::ExternalContext;
use nestmesh_core::importer::{LocalResolver, ModuleInstaller};
use nestmesh_core::message::CallMessage;
use std::sync::Arc;

struct NoLocalModules;

impl LocalResolver for NoLocalModules {
    fn try_local(&self, _fullname: &str) -> bool {
        false
    }
    fn is_loaded(&self, _fullname: &str) -> bool {
        false
    }
}

struct LoggingInstaller;

impl ModuleInstaller for LoggingInstaller {
    fn install(&self, fullname: &str, file: &str, source: &[u8]) -> Result<()> {
        tracing::info!(fullname, file, bytes = source.len(), "module installed");
        Ok(())
    }
}

/// A standalone binary has nothing registered to call into; every
/// request fails cleanly instead of panicking. A host embedding this
/// crate as a library supplies its own `CallDispatcher`.
struct NoFunctionsRegistered;

impl CallDispatcher for NoFunctionsRegistered {
    fn dispatch(&self, call: &CallMessage) -> std::result::Result<Vec<u8>, String> {
        Err(format!("no function registered for {}.{}", call.module, call.func))
    }
}

fn main() -> Result<()> {
    let args = BootArgs::from_env_or_args(None, None, None, None)?;
    let ctx = ExternalContext::main(args, Arc::new(NoLocalModules), Arc::new(LoggingInstaller), Arc::new(NoFunctionsRegistered))?;
    ctx.join();
    Ok(())
}
