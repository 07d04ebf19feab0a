//! The worker thread: sole owner of the mount table, the fid and tag
//! state, and every server transport.
//!
//! Callers rendezvous with the worker over a local stream socket bound at
//! `/tmp/rfsct_<pid>`. One request is one pointer-sized key naming a
//! descriptor deposited in the in-process [`Registry`]; the worker takes
//! the descriptor, executes it, writes the return code back and echoes the
//! key. The socket is purely a wakeup and ordering mechanism.
//!
//! Everything here runs on one thread: a current-thread runtime drives the
//! listener, the caller connections and the 9P transports cooperatively,
//! so the namespace needs no locking at all.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use crate::conv::Conversation;
use crate::error::Error;
use crate::fcall::DEFAULT_MSIZE;
use crate::namespace::{ConvId, MountFlag, Namespace, Source, SourceKind};
use crate::utils::Result;

/// The sun_path limit on the platforms we care about.
const SOCKET_PATH_MAX: usize = 104;

/// The operations a request descriptor can carry.
pub(crate) enum RequestKind {
    Bind {
        name: String,
        old: String,
        flags: MountFlag,
    },
    Mount {
        fd: OwnedFd,
        afid: u32,
        old: String,
        flags: MountFlag,
        aname: String,
    },
    Unmount {
        name: Option<String>,
        old: String,
    },
    Shutdown,
}

/// A caller-built request descriptor.
pub(crate) struct Request {
    pub kind: RequestKind,
}

enum Slot {
    Pending(Request),
    Done(i32),
}

/// The descriptor exchange backing the rendezvous: send = give,
/// receive = take back. Callers deposit a request and transmit its key;
/// the worker takes the request, completes the slot with the return code
/// and echoes the key.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Mutex<HashMap<u64, Slot>>,
    next: AtomicU64,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn deposit(&self, req: Request) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(token, Slot::Pending(req));
        token
    }

    fn take_pending(&self, token: u64) -> Option<Request> {
        let mut slots = self.lock();
        match slots.remove(&token) {
            Some(Slot::Pending(req)) => Some(req),
            Some(done) => {
                slots.insert(token, done);
                None
            }
            None => None,
        }
    }

    fn complete(&self, token: u64, ret: i32) {
        self.lock().insert(token, Slot::Done(ret));
    }

    pub fn take_done(&self, token: u64) -> Option<i32> {
        let mut slots = self.lock();
        match slots.remove(&token) {
            Some(Slot::Done(ret)) => Some(ret),
            Some(pending) => {
                slots.insert(token, pending);
                None
            }
            None => None,
        }
    }

    /// Forget a descriptor whatever state it is in, for callers bailing
    /// out after a broken exchange.
    pub fn discard(&self, token: u64) {
        self.lock().remove(&token);
    }
}

/// Where the rendezvous endpoint lives, truncated to fit sun_path.
pub(crate) fn rendezvous_path() -> PathBuf {
    let mut path = format!("/tmp/rfsct_{}", std::process::id());
    path.truncate(SOCKET_PATH_MAX);
    PathBuf::from(path)
}

fn peer_allowed(peer_uid: u32, own_euid: u32) -> bool {
    peer_uid == own_euid
}

/// Credential check on a fresh caller connection. A rejected peer is
/// closed before it gets a single byte back.
fn accept_peer(stream: &UnixStream) -> std::result::Result<(), u32> {
    let cred = match stream.peer_cred() {
        Ok(cred) => cred,
        Err(e) => {
            warn!("could not read peer credentials: {}", e);
            return Err(u32::MAX);
        }
    };
    let peer = cred.uid();
    if peer_allowed(peer, nix::unistd::geteuid().as_raw()) {
        Ok(())
    } else {
        Err(peer)
    }
}

/// Start the worker thread. Blocks until the rendezvous endpoint is
/// bound (or failed to bind), so callers can connect as soon as this
/// returns.
pub(crate) fn spawn(registry: Arc<Registry>) -> Result<(std::thread::JoinHandle<()>, PathBuf)> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<PathBuf>>();

    let handle = std::thread::Builder::new()
        .name("rfs9p-worker".to_owned())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            let local = LocalSet::new();
            local.block_on(&rt, worker_main(registry, ready_tx));
        })?;

    let path = ready_rx
        .recv()
        .map_err(|_| Error::from(crate::error::errno::EIO))??;
    Ok((handle, path))
}

struct Invocation {
    token: u64,
    done: oneshot::Sender<()>,
}

async fn worker_main(
    registry: Arc<Registry>,
    ready: std::sync::mpsc::Sender<Result<PathBuf>>,
) {
    let path = rendezvous_path();
    // a stale socket from a previous incarnation of this pid
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if ready.send(Ok(path.clone())).is_err() {
        return;
    }
    info!("listening for namespace calls on {}", path.display());

    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Invocation>();
    let mut worker = Worker {
        registry,
        ns: Namespace::new(),
        convs: HashMap::new(),
        next_conv: 0,
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => match accept_peer(&stream) {
                    Ok(()) => {
                        tokio::task::spawn_local(serve_caller(stream, req_tx.clone()));
                    }
                    Err(uid) => warn!("rejecting caller with uid {}", uid),
                },
                Err(e) => error!("accept failed: {}", e),
            },
            Some(inv) = req_rx.recv() => {
                if worker.dispatch(inv).await {
                    break;
                }
            }
        }
    }

    worker.teardown().await;
    drop(listener);
    let _ = std::fs::remove_file(&path);
    info!("worker stopped, rendezvous at {} removed", path.display());
}

/// One accepted caller connection: read a key, hand it to the dispatcher,
/// echo it back once the request completed. Requests from one caller are
/// strictly ordered by construction.
async fn serve_caller(mut stream: UnixStream, req_tx: mpsc::UnboundedSender<Invocation>) {
    let mut buf = [0u8; 8];
    loop {
        match stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!("caller connection lost: {}", e);
                return;
            }
        }
        let token = u64::from_le_bytes(buf);

        let (done_tx, done_rx) = oneshot::channel();
        if req_tx
            .send(Invocation {
                token,
                done: done_tx,
            })
            .is_err()
        {
            return;
        }
        if done_rx.await.is_err() {
            // shutdown, or a request the worker refused to answer;
            // the caller reads EOF
            return;
        }
        if let Err(e) = stream.write_all(&buf).await {
            debug!("echo to caller failed: {}", e);
            return;
        }
    }
}

fn rc(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!("request failed: {}", e);
            e.rc()
        }
    }
}

struct Worker {
    registry: Arc<Registry>,
    ns: Namespace,
    convs: HashMap<ConvId, Conversation<UnixStream>>,
    next_conv: ConvId,
}

impl Worker {
    /// Execute one received descriptor. Returns true when the worker
    /// should stop.
    async fn dispatch(&mut self, inv: Invocation) -> bool {
        let Some(req) = self.registry.take_pending(inv.token) else {
            error!("request key {:#x} names no descriptor", inv.token);
            // dropping `done` closes the caller connection
            return false;
        };

        let shutdown = matches!(req.kind, RequestKind::Shutdown);
        let ret = match req.kind {
            RequestKind::Bind { name, old, flags } => rc(self.bind(&name, &old, flags).await),
            RequestKind::Mount {
                fd,
                afid,
                old,
                flags,
                aname,
            } => rc(self.mount(fd, afid, &old, flags, &aname).await),
            RequestKind::Unmount { name, old } => rc(self.unmount(name.as_deref(), &old).await),
            RequestKind::Shutdown => 0,
        };
        self.registry.complete(inv.token, ret);

        if shutdown {
            // no echo; callers interpret EOF as completion
            return true;
        }
        let _ = inv.done.send(());
        false
    }

    async fn bind(&mut self, name: &str, old: &str, flags: MountFlag) -> Result<()> {
        debug!("bind {} onto {} ({:?})", name, old, flags);
        let displaced = self.ns.bind(name, old, flags)?;
        self.release_sources(displaced).await;
        Ok(())
    }

    async fn mount(
        &mut self,
        fd: OwnedFd,
        afid: u32,
        old: &str,
        flags: MountFlag,
        aname: &str,
    ) -> Result<()> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;

        let mut conv = Conversation::new(stream);
        let msize = conv.version(DEFAULT_MSIZE).await?;
        let uname = attach_uname();
        let (root_fid, qid) = conv.attach(afid, &uname, aname).await?;
        debug!(
            "attached {} as {} on {}: msize {}, root qid {:?}",
            aname, uname, old, msize, qid
        );

        let id = self.next_conv;
        self.next_conv += 1;
        self.convs.insert(id, conv);

        match self.ns.mount_remote(old, id, root_fid, aname, flags) {
            Ok(displaced) => {
                self.release_sources(displaced).await;
                Ok(())
            }
            Err(e) => {
                if let Some(conv) = self.convs.get_mut(&id) {
                    let _ = conv.clunk(root_fid).await;
                }
                self.convs.remove(&id);
                Err(e)
            }
        }
    }

    async fn unmount(&mut self, name: Option<&str>, old: &str) -> Result<()> {
        debug!("unmount {:?} from {}", name, old);
        let removed = self.ns.unmount(name, old)?;
        self.release_sources(removed).await;
        Ok(())
    }

    /// Clunk the root fids of removed remote sources and drop
    /// conversations nothing references any more. Failures are logged;
    /// the sources are gone either way.
    async fn release_sources(&mut self, sources: Vec<Source>) {
        for source in sources {
            let SourceKind::Remote {
                conv: id, root_fid, ..
            } = source.kind
            else {
                continue;
            };

            if let Some(conv) = self.convs.get_mut(&id) {
                if let Err(e) = conv.clunk(root_fid).await {
                    warn!("clunk of root fid {} failed: {}", root_fid, e);
                }
                if conv.is_torn() {
                    self.ns.sever_conv(id);
                    self.convs.remove(&id);
                    continue;
                }
            }
            if !self.ns.references_conv(id) {
                debug!("conversation {} has no sources left, closing", id);
                self.convs.remove(&id);
            }
        }
    }

    async fn teardown(&mut self) {
        let sources = self.ns.drain();
        self.release_sources(sources).await;
        self.convs.clear();
    }
}

/// The user name quoted in `Tattach`.
fn attach_uname() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| "none".to_owned())
}
