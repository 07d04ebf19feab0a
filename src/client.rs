//! The caller-facing API: `init`, `deinit`, `bind`, `mount`, `unmount`.
//!
//! A [`Client`] owns the worker thread servicing the process-wide
//! namespace. The methods here run on whatever thread the application
//! calls them from; each builds a request descriptor, hands it to the
//! worker through the rendezvous socket and blocks until the worker
//! echoes the descriptor's key back with the return code filled in.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use nix::errno::Errno;

use crate::error::{Error, errno::*};
use crate::namespace::MountFlag;
use crate::utils::Result;
use crate::worker::{self, Registry, Request, RequestKind};

static CLIENT_IDS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Each caller thread keeps its own connection to the worker,
    // established on first use, keyed by client instance.
    static CONNS: RefCell<HashMap<u64, UnixStream>> = RefCell::new(HashMap::new());
}

/// Handle on the process-wide remote filesystem namespace.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and are safe
/// to call from any number of threads.
pub struct Client {
    id: u64,
    path: PathBuf,
    registry: Arc<Registry>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Client {
    /// Start the worker thread and bind the rendezvous endpoint.
    /// Returns once the endpoint accepts connections.
    pub fn init() -> Result<Client> {
        let registry = Arc::new(Registry::default());
        let (worker, path) = worker::spawn(registry.clone())?;
        debug!("namespace worker up at {}", path.display());

        Ok(Client {
            id: CLIENT_IDS.fetch_add(1, Ordering::Relaxed),
            path,
            registry,
            worker: Some(worker),
        })
    }

    /// Graft `name`'s resolution onto the mount point `old`.
    pub fn bind(&self, name: &str, old: &str, flags: MountFlag) -> Result<()> {
        self.invoke(RequestKind::Bind {
            name: name.to_owned(),
            old: old.to_owned(),
            flags,
        })
    }

    /// Adopt the already-opened transport `fd` as a 9P conversation,
    /// negotiate and attach, and mount the remote tree at `old`.
    ///
    /// `afid` is a fid previously established through the auth exchange,
    /// or `NOFID` when the server requires none.
    pub fn mount(
        &self,
        fd: OwnedFd,
        afid: u32,
        old: &str,
        flags: MountFlag,
        aname: &str,
    ) -> Result<()> {
        self.invoke(RequestKind::Mount {
            fd,
            afid,
            old: old.to_owned(),
            flags,
            aname: aname.to_owned(),
        })
    }

    /// Remove the source `name` from the mount point `old`, or every
    /// source there when `name` is `None`.
    pub fn unmount(&self, name: Option<&str>, old: &str) -> Result<()> {
        self.invoke(RequestKind::Unmount {
            name: name.map(str::to_owned),
            old: old.to_owned(),
        })
    }

    /// Stop the worker and wait for it. Callers still blocked on a
    /// response observe EOF.
    pub fn deinit(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match self.invoke(RequestKind::Shutdown) {
            // EOF is how the worker acknowledges shutdown
            Err(e) if e.errno() == ECONNRESET => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        worker.join().map_err(|_| Error::No(EIO))
    }

    fn invoke(&self, kind: RequestKind) -> Result<()> {
        let token = self.registry.deposit(Request { kind });

        match self.exchange(token) {
            Ok(()) => {
                let ret = self.registry.take_done(token).ok_or(Error::No(EBADMSG))?;
                if ret < 0 {
                    Err(Error::No(Errno::from_raw(-ret)))
                } else {
                    Ok(())
                }
            }
            Err(e) => {
                self.registry.discard(token);
                Err(e)
            }
        }
    }

    /// Send the descriptor key and block for the echo on this thread's
    /// connection. A connection that misbehaves is dropped so the next
    /// call starts fresh.
    fn exchange(&self, token: u64) -> Result<()> {
        CONNS.with(|conns| {
            let mut conns = conns.borrow_mut();
            let stream = match conns.entry(self.id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(slot) => slot.insert(UnixStream::connect(&self.path)?),
            };

            let outcome = exchange_on(stream, token);
            if outcome.is_err() {
                conns.remove(&self.id);
            }
            outcome
        })
    }
}

fn exchange_on(stream: &mut UnixStream, token: u64) -> Result<()> {
    stream.write_all(&token.to_le_bytes())?;

    let mut buf = [0u8; 8];
    let mut have = 0;
    while have < buf.len() {
        let n = stream.read(&mut buf[have..])?;
        if n == 0 {
            // clean EOF means the worker went away; a torn-off key is a
            // framing violation
            return Err(Error::No(if have == 0 { ECONNRESET } else { EMSGSIZE }));
        }
        have += n;
    }

    if u64::from_le_bytes(buf) != token {
        return Err(Error::No(EBADMSG));
    }
    Ok(())
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{FCall, Msg, NOFID, NOTAG, P92000, QId, QIdType};
    use crate::serialize::{read_msg, write_msg};
    use std::sync::Mutex;

    // The rendezvous path is keyed by pid, so the tests below take turns
    // owning the worker.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[test]
    fn bind_unmount_lifecycle() {
        let _guard = serial();
        let client = Client::init().unwrap();

        client.bind("/a", "/n", MountFlag::REPL).unwrap();
        client.bind("/b", "/n", MountFlag::AFTER).unwrap();

        client.unmount(Some("/a"), "/n").unwrap();
        client.unmount(None, "/n").unwrap();
        assert_eq!(client.unmount(None, "/n").unwrap_err().errno(), ENOENT);

        client.deinit().unwrap();
    }

    #[test]
    fn invalid_flags_are_reported() {
        let _guard = serial();
        let client = Client::init().unwrap();

        let err = client
            .bind("/a", "/n", MountFlag::BEFORE | MountFlag::AFTER)
            .unwrap_err();
        assert_eq!(err.errno(), EINVAL);

        let err = client.bind("/a", "/b/../c", MountFlag::REPL).unwrap_err();
        assert_eq!(err.errno(), EINVAL);

        client.deinit().unwrap();
    }

    #[test]
    fn bind_cycles_are_reported() {
        let _guard = serial();
        let client = Client::init().unwrap();

        client.bind("/a", "/b", MountFlag::REPL).unwrap();
        let err = client.bind("/b", "/a", MountFlag::REPL).unwrap_err();
        assert_eq!(err.errno(), ELOOP);

        client.deinit().unwrap();
    }

    #[test]
    fn concurrent_callers_build_disjoint_mounts() {
        let _guard = serial();
        let client = Arc::new(Client::init().unwrap());

        const THREADS: usize = 8;
        const BINDS: usize = 16;

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let client = client.clone();
                std::thread::spawn(move || {
                    for b in 0..BINDS {
                        client
                            .bind(
                                &format!("/src{}_{}", t, b),
                                &format!("/mnt{}_{}", t, b),
                                MountFlag::REPL,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        // every one of the N*M mount points must exist exactly once
        for t in 0..THREADS {
            for b in 0..BINDS {
                let old = format!("/mnt{}_{}", t, b);
                client.unmount(None, &old).unwrap();
                assert_eq!(client.unmount(None, &old).unwrap_err().errno(), ENOENT);
            }
        }

        Arc::try_unwrap(client)
            .unwrap_or_else(|_| panic!("client still shared"))
            .deinit()
            .unwrap();
    }

    #[test]
    fn deinit_surfaces_as_eof_to_other_callers() {
        let _guard = serial();
        let client = Client::init().unwrap();

        // A second caller sits blocked on its receive while the worker is
        // told to shut down; it must observe EOF, not garbage.
        let mut conn = UnixStream::connect(&client.path).unwrap();
        let blocked = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(n, 0);
        });

        client.bind("/a", "/n", MountFlag::REPL).unwrap();
        client.deinit().unwrap();
        blocked.join().unwrap();
    }

    /// A scripted 9P server for the other end of a mount fd: negotiates,
    /// attaches and then answers clunks until EOF.
    fn scripted_server(mut stream: UnixStream) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let tversion = read_msg(&mut stream).unwrap();
            assert_eq!(tversion.tag, NOTAG);
            match tversion.body {
                FCall::TVersion { version, .. } => assert_eq!(version, P92000),
                other => panic!("expected TVersion, got {:?}", other),
            }
            write_msg(
                &mut stream,
                &Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 8192,
                        version: P92000.to_owned(),
                    },
                },
            )
            .unwrap();

            let tattach = read_msg(&mut stream).unwrap();
            let fid = match tattach.body {
                FCall::TAttach { fid, afid, .. } => {
                    assert_eq!(afid, NOFID);
                    fid
                }
                other => panic!("expected TAttach, got {:?}", other),
            };
            write_msg(
                &mut stream,
                &Msg {
                    tag: tattach.tag,
                    body: FCall::RAttach {
                        qid: QId {
                            typ: QIdType::DIR,
                            version: 0,
                            path: 1,
                        },
                    },
                },
            )
            .unwrap();

            // serve clunks until the worker drops the transport
            loop {
                let msg = match read_msg(&mut stream) {
                    Ok(msg) => msg,
                    Err(_) => return,
                };
                match msg.body {
                    FCall::TClunk { fid: clunked } => {
                        assert_eq!(clunked, fid);
                        write_msg(
                            &mut stream,
                            &Msg {
                                tag: msg.tag,
                                body: FCall::RClunk,
                            },
                        )
                        .unwrap();
                    }
                    other => panic!("expected TClunk, got {:?}", other),
                }
            }
        })
    }

    #[test]
    fn mount_negotiates_and_unmount_clunks() {
        let _guard = serial();
        let client = Client::init().unwrap();

        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = scripted_server(theirs);

        client
            .mount(OwnedFd::from(ours), NOFID, "/n", MountFlag::REPL, "")
            .unwrap();

        // a second tree mounted ahead of the first
        let (ours2, theirs2) = UnixStream::pair().unwrap();
        let server2 = scripted_server(theirs2);
        client
            .mount(OwnedFd::from(ours2), NOFID, "/n", MountFlag::BEFORE, "")
            .unwrap();

        // removing the union clunks both root fids
        client.unmount(None, "/n").unwrap();

        server.join().unwrap();
        server2.join().unwrap();
        client.deinit().unwrap();
    }

    #[test]
    fn mount_failure_reports_server_refusal() {
        let _guard = serial();
        let client = Client::init().unwrap();

        let (ours, theirs) = UnixStream::pair().unwrap();
        let refusing = std::thread::spawn(move || {
            let mut stream = theirs;
            let _ = read_msg(&mut stream).unwrap();
            write_msg(
                &mut stream,
                &Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 0,
                        version: crate::fcall::VERSION_UNKNOWN.to_owned(),
                    },
                },
            )
            .unwrap();
        });

        let err = client
            .mount(OwnedFd::from(ours), NOFID, "/n", MountFlag::REPL, "")
            .unwrap_err();
        assert_eq!(err.errno(), EPROTONOSUPPORT);

        refusing.join().unwrap();
        client.deinit().unwrap();
    }
}
