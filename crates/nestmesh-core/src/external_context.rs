//! Child-side boot orchestrator: wires every other module together over
//! the bootstrap descriptors a real parent hands a spawned child (spec.md
//! §4.10, §6 "Bootstrap descriptors").

use crate::broker::Broker;
use crate::call_dispatch::{spawn_call_dispatch_loop, CallDispatcher};
use crate::channel::Channel;
use crate::config::BootArgs;
use crate::context::Context;
use crate::error::{NestmeshError, Result};
use crate::importer::{Importer, LocalResolver, ModuleInstaller};
use crate::io_logger::IoLogger;
use crate::log_handler::LogHandler;
use crate::router::Router;
use crate::stream::Stream;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

/// Descriptor the parent stream is bootstrapped on, both directions
/// (spec.md §6).
pub const PARENT_STREAM_FD: RawFd = 100;
/// One-shot metadata channel carrying `"<core_size>\n<core_source>"`,
/// used once at startup to seed the module cache.
pub const CORE_METADATA_FD: RawFd = 101;

const DEFAULT_IMPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a child process needs kept alive for the lifetime of its
/// participation in the context tree.
pub struct ExternalContext {
    pub broker: Broker,
    pub router: Arc<Router>,
    pub parent: Arc<Context>,
    pub importer: Arc<Importer>,
    call_dispatch: JoinHandle<()>,
}

impl ExternalContext {
    /// Performs the full boot sequence described in spec.md §6: accepts
    /// the parent stream on fd 100, seeds the importer from fd 101,
    /// redirects fd 1/2 through `IoLogger`, rebinds fd 0 to the null
    /// device, installs the forwarding log layer, and starts the
    /// `CALL_FUNCTION` dispatch loop (spec.md §1(e)).
    pub fn main(
        args: BootArgs,
        resolver: Arc<dyn LocalResolver>,
        installer: Arc<dyn ModuleInstaller>,
        dispatcher: Arc<dyn CallDispatcher>,
    ) -> Result<Arc<Self>> {
        let broker = Broker::spawn()?;
        let handle = broker.handle();

        let stream = Stream::accept(PARENT_STREAM_FD, PARENT_STREAM_FD, args.parent_id, &args.key, handle.clone())?;
        let router = Router::new(args.context_id, handle.clone());
        router.register(args.parent_id, stream);

        let parent = Context::new(args.parent_id, args.context_id, "parent", &router);
        router.set_parent(parent.clone());

        let importer = Importer::new(parent.clone(), resolver, installer, Some(DEFAULT_IMPORT_TIMEOUT));
        if let Some((name, path, compressed)) = read_core_metadata(CORE_METADATA_FD)? {
            importer.seed(&name, &path, compressed);
        }

        install_io_logger("stdout", 1, &handle)?;
        install_io_logger("stderr", 2, &handle)?;
        rebind_to_null(0)?;

        let subscriber = tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::from_level(args.log_level))
            .with(LogHandler::new(parent.clone()));
        let _ = tracing::subscriber::set_global_default(subscriber);

        let call_dispatch = spawn_call_dispatch_loop(parent.clone(), dispatcher);

        Ok(Arc::new(Self { broker, router, parent, importer, call_dispatch }))
    }

    /// Opens a handle-scoped `Channel` against the parent context, for
    /// boot code that wants a blocking receive primitive immediately.
    pub fn open_channel(&self, handle: Option<u32>) -> Arc<Channel> {
        Channel::new(&self.parent, handle)
    }

    pub fn join(self: Arc<Self>) {
        match Arc::try_unwrap(self) {
            Ok(this) => {
                this.broker.join();
                let _ = this.call_dispatch.join();
            }
            Err(shared) => shared.broker.handle().shutdown(),
        }
    }
}

/// Reads `"<core_size>\n<core_source>"` off `fd`, compresses the source
/// with zlib (the Importer's cache stores everything compressed, the
/// same shape a `GET_MODULE` reply uses), and names it for self-seeding.
fn read_core_metadata(fd: RawFd) -> Result<Option<(String, String, Vec<u8>)>> {
    let mut file = unsafe { std::fs::File::from_raw_fd_checked(fd)? };
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    std::mem::forget(file); // fd 101 is a one-shot, process-owned descriptor; leave it be.

    if raw.is_empty() {
        return Ok(None);
    }
    let Some(newline) = raw.iter().position(|&b| b == b'\n') else {
        return Err(NestmeshError::import("nestmesh_core", "core metadata missing size line"));
    };
    let (size_line, rest) = raw.split_at(newline);
    let source = &rest[1..];
    let expected: usize = std::str::from_utf8(size_line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| NestmeshError::import("nestmesh_core", "core metadata size was not decimal"))?;
    if source.len() != expected {
        return Err(NestmeshError::import("nestmesh_core", "core metadata size did not match payload length"));
    }

    let compressed = compress(source);
    Ok(Some(("nestmesh_core".to_string(), "bootstrap:nestmesh_core".to_string(), compressed)))
}

fn compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Creates a socket pair, hands the write end to the target descriptor
/// (stdout or stderr), and arms the broker on the read end.
fn install_io_logger(name: &str, target_fd: RawFd, broker: &crate::broker::BrokerHandle) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    let (keep, redirect) = UnixStream::pair()?;
    let logger = IoLogger::install(name, keep.as_raw_fd(), keep.as_raw_fd(), broker)?;
    std::mem::forget(logger);

    if unsafe { libc::dup2(redirect.as_raw_fd(), target_fd) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    std::mem::forget(redirect);
    std::mem::forget(keep);
    Ok(())
}

fn rebind_to_null(target_fd: RawFd) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    if unsafe { libc::dup2(null.as_raw_fd(), target_fd) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// A process-owned descriptor the bootstrap hands us; `File::from_raw_fd`
/// is unsafe in the general case but sound here because the descriptor is
/// guaranteed open and process-exclusive by the spawning parent.
trait FromRawFdChecked: Sized {
    unsafe fn from_raw_fd_checked(fd: RawFd) -> Result<Self>;
}

impl FromRawFdChecked for std::fs::File {
    unsafe fn from_raw_fd_checked(fd: RawFd) -> Result<Self> {
        if libc::fcntl(fd, libc::F_GETFD) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(<std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn core_metadata_parses_size_prefixed_source() {
        let mut tmp = tempfile::tempfile().unwrap();
        let source = b"fn bootstrap() {}";
        write!(tmp, "{}\n", source.len()).unwrap();
        tmp.write_all(source).unwrap();
        use std::io::Seek;
        tmp.seek(std::io::SeekFrom::Start(0)).unwrap();

        let fd = tmp.as_raw_fd();
        let result = read_core_metadata(fd).unwrap();
        let (name, path, compressed) = result.expect("metadata present");
        assert_eq!(name, "nestmesh_core");
        assert_eq!(path, "bootstrap:nestmesh_core");
        assert!(!compressed.is_empty());
    }
}
