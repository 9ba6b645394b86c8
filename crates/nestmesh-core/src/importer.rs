//! Remote module loader (spec.md §4.7).
//!
//! Rust has no runtime import machinery to hook into, so the two points
//! where the original relies on the host language's dynamic loader are
//! pluggable traits here: [`LocalResolver`] answers "is this name already
//! satisfied locally" and [`ModuleInstaller`] performs whatever the host
//! program considers "installing" a unit of remote source (registering it
//! with a plugin registry, a scripting runtime, etc.) — this crate only
//! owns the cache, the request/reply protocol, and the ownership policy.

use crate::context::Context;
use crate::error::{NestmeshError, Result};
use crate::message::{decode, ModuleReply, GET_MODULE};
use flate2::read::ZlibDecoder;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

thread_local! {
    static IN_FIND_MODULE: Cell<bool> = Cell::new(false);
}

/// Hook into whatever local resolution mechanism the host program has
/// (a crate registry, a scripting engine's own loader, ...).
pub trait LocalResolver: Send + Sync {
    /// `true` if `fullname` is already satisfied without our help.
    fn try_local(&self, fullname: &str) -> bool;
    /// `true` if `fullname` is already loaded, by any means.
    fn is_loaded(&self, fullname: &str) -> bool;
}

/// Hook that actually materializes a remote module's decompressed source
/// into the host program once the Importer has fetched it.
pub trait ModuleInstaller: Send + Sync {
    fn install(&self, fullname: &str, file: &str, source: &[u8]) -> Result<()>;
}

pub struct Importer {
    context: Arc<Context>,
    resolver: Arc<dyn LocalResolver>,
    installer: Arc<dyn ModuleInstaller>,
    cache: Mutex<HashMap<String, ModuleReply>>,
    known_submodules: Mutex<HashMap<String, Vec<String>>>,
    loaded_by_us: Mutex<HashSet<String>>,
    timeout: Option<Duration>,
}

impl Importer {
    pub fn new(
        context: Arc<Context>,
        resolver: Arc<dyn LocalResolver>,
        installer: Arc<dyn ModuleInstaller>,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            resolver,
            installer,
            cache: Mutex::new(HashMap::new()),
            known_submodules: Mutex::new(HashMap::new()),
            loaded_by_us: Mutex::new(HashSet::new()),
            timeout,
        })
    }

    /// Pre-populates the cache with the bootstrap core's own (compressed)
    /// source, so a child re-serving descendants can satisfy requests for
    /// it without a round trip to its own parent.
    pub fn seed(&self, fullname: &str, source_path: &str, compressed_source: Vec<u8>) {
        self.cache.lock().unwrap().insert(
            fullname.to_string(),
            ModuleReply { children: None, source_path: source_path.to_string(), compressed_source },
        );
    }

    /// Decides whether this importer should claim ownership of `fullname`.
    /// Thread-local-guarded against re-entry from within `try_local`
    /// itself querying back into us.
    pub fn find_module(&self, fullname: &str) -> bool {
        if IN_FIND_MODULE.with(Cell::get) {
            return false;
        }
        IN_FIND_MODULE.with(|c| c.set(true));
        let result = self.find_module_inner(fullname);
        IN_FIND_MODULE.with(|c| c.set(false));
        result
    }

    fn find_module_inner(&self, fullname: &str) -> bool {
        if let Some(parent) = parent_package(fullname) {
            if let Some(children) = self.known_submodules.lock().unwrap().get(parent) {
                let leaf = leaf_name(fullname);
                if !children.iter().any(|c| c == leaf) {
                    return false;
                }
            }
            if self.resolver.is_loaded(parent) && !self.loaded_by_us.lock().unwrap().contains(parent) {
                return false;
            }
        }
        if self.resolver.try_local(fullname) {
            return false;
        }
        true
    }

    /// Returns the cached record if present; otherwise fetches, installs,
    /// and caches it via a blocking `GET_MODULE` round trip to the parent.
    pub fn load_module(&self, fullname: &str) -> Result<()> {
        if self.cache.lock().unwrap().contains_key(fullname) {
            return Ok(());
        }

        let reply = self.context.send_await(GET_MODULE, fullname.as_bytes().to_vec(), self.timeout)?;
        let reply: Option<ModuleReply> = decode(&reply.data)?;
        let Some(module) = reply else {
            return Err(NestmeshError::import(fullname, "master does not have it"));
        };

        let source = decompress(&module.compressed_source)?;
        let file = format!("master:{}", module.source_path);
        self.installer.install(fullname, &file, &source)?;

        self.loaded_by_us.lock().unwrap().insert(fullname.to_string());
        if let Some(children) = &module.children {
            self.known_submodules.lock().unwrap().insert(fullname.to_string(), children.clone());
        }
        self.cache.lock().unwrap().insert(fullname.to_string(), module);
        Ok(())
    }
}

fn parent_package(fullname: &str) -> Option<&str> {
    fullname.rsplit_once('.').map(|(parent, _)| parent)
}

fn leaf_name(fullname: &str) -> &str {
    fullname.rsplit('.').next().unwrap_or(fullname)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::router::Router;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysMiss;
    impl LocalResolver for AlwaysMiss {
        fn try_local(&self, _fullname: &str) -> bool {
            false
        }
        fn is_loaded(&self, _fullname: &str) -> bool {
            false
        }
    }

    struct RecordingInstaller {
        installs: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
    }
    impl ModuleInstaller for RecordingInstaller {
        fn install(&self, fullname: &str, file: &str, source: &[u8]) -> Result<()> {
            self.installs.lock().unwrap().push((fullname.to_string(), file.to_string(), source.to_vec()));
            Ok(())
        }
    }

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn find_module_declines_when_parent_known_and_submodule_not_listed() {
        let broker = Broker::spawn().unwrap();
        let router = Router::new(1, broker.handle());
        let ctx = Context::new(2, 1, "parent", &router);
        let importer = Importer::new(ctx, Arc::new(AlwaysMiss), Arc::new(RecordingInstaller { installs: Arc::new(Mutex::new(vec![])) }), None);
        importer.known_submodules.lock().unwrap().insert("pkg".into(), vec!["known".into()]);
        assert!(!importer.find_module("pkg.unknown"));
        assert!(importer.find_module("pkg.known"));
        broker.join();
    }

    #[test]
    fn load_module_is_idempotent_after_first_fetch() {
        let broker = Broker::spawn().unwrap();
        let router = Router::new(1, broker.handle());
        let ctx = Context::new(2, 1, "parent", &router);
        let installs = Arc::new(Mutex::new(Vec::new()));
        let importer = Importer::new(
            ctx,
            Arc::new(AlwaysMiss),
            Arc::new(RecordingInstaller { installs: installs.clone() }),
            Some(Duration::from_secs(1)),
        );

        let requests = Arc::new(AtomicUsize::new(0));
        importer.seed("already.cached", "already/cached.py", zlib_compress(b"x = 1"));
        assert!(importer.load_module("already.cached").is_ok());
        assert_eq!(requests.load(Ordering::SeqCst), 0);
        assert!(installs.lock().unwrap().is_empty());
        broker.join();
    }
}
