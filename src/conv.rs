//! One 9P conversation: a versioned, attached exchange of T- and
//! R-messages over a single transport.
//!
//! The conversation owns everything scoped to the connection: the agreed
//! msize, the tag and fid allocators, the set of in-flight tags and the
//! flush bookkeeping. All methods run on the worker thread; callers never
//! touch a conversation directly.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BufMut, BytesMut};
use futures::SinkExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, length_delimited::LengthDelimitedCodec};

use crate::error::{Error, errno::*, errno_from_ename};
use crate::fcall::*;
use crate::serialize::{Decodable, Encodable};
use crate::utils::Result;
use crate::{io_err, res};

/// Bounded retry for idempotent requests (Tstat, Tclunk).
const IDEMPOTENT_TRIES: usize = 2;

/// Tags are handed out monotonically and reclaimed through a free list
/// once their response is consumed. `NOTAG` is reserved for the version
/// exchange and is never produced here.
#[derive(Debug, Default)]
struct TagAllocator {
    next: u16,
    free: Vec<u16>,
}

impl TagAllocator {
    fn acquire(&mut self) -> Result<u16> {
        if let Some(tag) = self.free.pop() {
            return Ok(tag);
        }
        if self.next == NOTAG {
            return Err(Error::No(EAGAIN));
        }
        let tag = self.next;
        self.next += 1;
        Ok(tag)
    }

    fn release(&mut self, tag: u16) {
        self.free.push(tag);
    }
}

/// Dense fid allocation with free-list reuse. `NOFID` is never returned;
/// running out of fids is `EMFILE`.
#[derive(Debug, Default)]
struct FidAllocator {
    next: u32,
    free: Vec<u32>,
}

impl FidAllocator {
    fn acquire(&mut self) -> Result<u32> {
        if let Some(fid) = self.free.pop() {
            return Ok(fid);
        }
        if self.next == NOFID {
            return Err(Error::No(EMFILE));
        }
        let fid = self.next;
        self.next += 1;
        Ok(fid)
    }

    fn release(&mut self, fid: u32) {
        self.free.push(fid);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConvState {
    Init,
    Versioned,
    Attached,
    Torn,
}

pub struct Conversation<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    state: ConvState,
    msize: u32,
    tags: TagAllocator,
    fids: FidAllocator,
    inflight: HashSet<u16>,
    /// Tags with a Tflush outstanding; replies for them are discarded.
    flushing: HashSet<u16>,
    /// Replies that arrived while waiting for a different tag.
    pending: HashMap<u16, Msg>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Conversation<T> {
    pub fn new(transport: T) -> Conversation<T> {
        let framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_framed(transport);

        Conversation {
            framed,
            state: ConvState::Init,
            msize: DEFAULT_MSIZE,
            tags: TagAllocator::default(),
            fids: FidAllocator::default(),
            inflight: HashSet::new(),
            flushing: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn is_torn(&self) -> bool {
        self.state == ConvState::Torn
    }

    fn tear(&mut self) {
        self.state = ConvState::Torn;
    }

    /// Largest read/write payload the agreed msize leaves room for.
    pub fn iounit(&self) -> u32 {
        self.msize - IOHDRSZ
    }

    async fn send(&mut self, msg: &Msg) -> Result<()> {
        if self.state != ConvState::Init && msg.size() > self.msize {
            return Err(Error::No(EMSGSIZE));
        }

        let mut writer = BytesMut::with_capacity(msg.size() as usize).writer();
        msg.encode(&mut writer)?;
        debug!("→ {:?}", msg);

        if let Err(e) = self.framed.send(writer.into_inner().freeze()).await {
            self.tear();
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Msg> {
        match self.framed.next().await {
            Some(Ok(bytes)) => {
                let mut reader = bytes.reader();
                let msg: Msg = Decodable::decode(&mut reader)?;
                if reader.get_ref().has_remaining() {
                    self.tear();
                    return res!(io_err!(InvalidData, "frame size disagrees with contents"));
                }
                debug!("← {:?}", msg);
                Ok(msg)
            }
            Some(Err(e)) => {
                self.tear();
                Err(e.into())
            }
            None => {
                self.tear();
                Err(Error::No(ECONNRESET))
            }
        }
    }

    /// What is legal to send in the current conversation state.
    fn check_legal(&self, body: &FCall) -> Result<()> {
        match self.state {
            ConvState::Torn => Err(Error::No(EIO)),
            ConvState::Init => Err(Error::No(EPROTO)),
            ConvState::Versioned => match body {
                FCall::TAuth { .. } | FCall::TAttach { .. } | FCall::TFlush { .. } => Ok(()),
                _ => Err(Error::No(EPROTO)),
            },
            ConvState::Attached => match body {
                FCall::TVersion { .. } => Err(Error::No(EPROTO)),
                _ => Ok(()),
            },
        }
    }

    /// Allocate a tag, transmit the request and mark it in flight.
    pub async fn submit(&mut self, body: FCall) -> Result<u16> {
        self.check_legal(&body)?;
        let tag = self.tags.acquire()?;
        let msg = Msg { tag, body };
        if let Err(e) = self.send(&msg).await {
            self.tags.release(tag);
            return Err(e);
        }
        self.inflight.insert(tag);
        Ok(tag)
    }

    /// Consume the response for `tag`, stashing replies that belong to
    /// other outstanding requests and discarding replies to flushed ones.
    pub async fn wait(&mut self, tag: u16) -> Result<FCall> {
        if !self.inflight.contains(&tag) {
            return Err(Error::No(EINVAL));
        }
        loop {
            if let Some(msg) = self.pending.remove(&tag) {
                self.complete(tag);
                return Ok(msg.body);
            }

            let msg = self.recv().await?;
            if msg.tag == tag {
                self.complete(tag);
                return Ok(msg.body);
            }
            if self.flushing.contains(&msg.tag) {
                // The server answered before it saw our Tflush; the tag
                // stays held until Rflush arrives.
                debug!("discarding reply for flushed tag {}", msg.tag);
            } else if self.inflight.contains(&msg.tag) {
                self.pending.insert(msg.tag, msg);
            } else {
                warn!("reply for tag {} which is not in flight", msg.tag);
            }
        }
    }

    fn complete(&mut self, tag: u16) {
        self.inflight.remove(&tag);
        self.tags.release(tag);
    }

    async fn rpc(&mut self, body: FCall) -> Result<FCall> {
        let ttype = MsgType::from(&body);
        let tag = self.submit(body).await?;
        let resp = self.wait(tag).await?;

        match resp {
            FCall::RError { ename } => Err(Error::No(errno_from_ename(&ename))),
            resp => {
                if MsgType::from(&resp) as u8 != ttype as u8 + 1 {
                    self.tear();
                    return Err(Error::No(EPROTO));
                }
                Ok(resp)
            }
        }
    }

    async fn rpc_idempotent(&mut self, body: FCall) -> Result<FCall> {
        let mut last = Error::No(EIO);
        for _ in 0..IDEMPOTENT_TRIES {
            match self.rpc(body.clone()).await {
                Err(e)
                    if matches!(e.errno(), EINTR | EAGAIN | ETIMEDOUT) && !self.is_torn() =>
                {
                    last = e;
                }
                other => return other,
            }
        }
        Err(last)
    }

    /// Negotiate the protocol version. Returns the agreed msize, the
    /// minimum of what we proposed and what the server granted.
    pub async fn version(&mut self, msize: u32) -> Result<u32> {
        if self.state != ConvState::Init {
            return Err(Error::No(EPROTO));
        }

        self.send(&Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize,
                version: P92000.to_owned(),
            },
        })
        .await?;

        let resp = self.recv().await?;
        if resp.tag != NOTAG {
            self.tear();
            return Err(Error::No(EPROTO));
        }
        match resp.body {
            FCall::RVersion {
                msize: granted,
                version,
            } => {
                if version != P92000 {
                    // `unknown` or some 9P dialect we do not speak
                    return Err(Error::No(EPROTONOSUPPORT));
                }
                if granted <= IOHDRSZ {
                    self.tear();
                    return Err(Error::No(EPROTO));
                }
                self.msize = msize.min(granted);
                self.state = ConvState::Versioned;
                Ok(self.msize)
            }
            FCall::RError { ename } => Err(Error::No(errno_from_ename(&ename))),
            _ => {
                self.tear();
                Err(Error::No(EPROTO))
            }
        }
    }

    /// Establish an auth fid for the caller to negotiate on. The
    /// negotiation itself is the caller's business; the afid is simply
    /// carried through to `attach`.
    pub async fn auth(&mut self, uname: &str, aname: &str) -> Result<(u32, QId)> {
        let afid = self.fids.acquire()?;
        match self
            .rpc(FCall::TAuth {
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await
        {
            Ok(FCall::RAuth { aqid }) => Ok((afid, aqid)),
            Ok(_) => Err(Error::No(EPROTO)),
            Err(e) => {
                // the server never saw a fid it did not grant
                self.fids.release(afid);
                Err(e)
            }
        }
    }

    /// Attach to a tree the server exports, yielding its root fid.
    pub async fn attach(&mut self, afid: u32, uname: &str, aname: &str) -> Result<(u32, QId)> {
        let fid = self.fids.acquire()?;
        match self
            .rpc(FCall::TAttach {
                fid,
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await
        {
            Ok(FCall::RAttach { qid }) => {
                self.state = ConvState::Attached;
                Ok((fid, qid))
            }
            Ok(_) => Err(Error::No(EPROTO)),
            Err(e) => {
                self.fids.release(fid);
                Err(e)
            }
        }
    }

    /// Walk from `fid` to a new fid naming the entry `wnames` leads to.
    /// Paths longer than `MAXWELEM` are walked in chunks.
    pub async fn walk(&mut self, fid: u32, wnames: &[String]) -> Result<(u32, Vec<QId>)> {
        let newfid = self.fids.acquire()?;
        let mut qids = Vec::with_capacity(wnames.len());
        let mut from = fid;

        let mut chunks: Vec<&[String]> = wnames.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            chunks.push(&[]); // a bare clone of fid
        }

        for chunk in chunks {
            let resp = self
                .rpc(FCall::TWalk {
                    fid: from,
                    newfid,
                    wnames: chunk.to_vec(),
                })
                .await;

            match resp {
                Ok(FCall::RWalk { wqids }) => {
                    let complete = wqids.len() == chunk.len();
                    qids.extend(wqids);
                    if !complete {
                        // partial walk: the server did not move newfid
                        if from == newfid {
                            let _ = self.clunk(newfid).await;
                        } else {
                            self.fids.release(newfid);
                        }
                        return Err(Error::No(ENOENT));
                    }
                }
                Ok(_) => return Err(Error::No(EPROTO)),
                Err(e) => {
                    if from == newfid {
                        let _ = self.clunk(newfid).await;
                    } else {
                        self.fids.release(newfid);
                    }
                    return Err(e);
                }
            }
            from = newfid;
        }

        Ok((newfid, qids))
    }

    pub async fn open(&mut self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.rpc(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            _ => Err(Error::No(EPROTO)),
        }
    }

    pub async fn create(
        &mut self,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)> {
        match self
            .rpc(FCall::TCreate {
                fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?
        {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            _ => Err(Error::No(EPROTO)),
        }
    }

    pub async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Data> {
        let count = count.min(self.iounit());
        match self.rpc(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data),
            _ => Err(Error::No(EPROTO)),
        }
    }

    /// Write at most one message's worth of `data`; returns the number of
    /// bytes the server accepted.
    pub async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let take = (data.len() as u64).min(self.iounit() as u64) as usize;
        match self
            .rpc(FCall::TWrite {
                fid,
                offset,
                data: Data(data[..take].to_vec()),
            })
            .await?
        {
            FCall::RWrite { count } => Ok(count),
            _ => Err(Error::No(EPROTO)),
        }
    }

    pub async fn stat(&mut self, fid: u32) -> Result<Stat> {
        match self.rpc_idempotent(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(Error::No(EPROTO)),
        }
    }

    pub async fn wstat(&mut self, fid: u32, stat: &Stat) -> Result<()> {
        match self
            .rpc(FCall::TWStat {
                fid,
                stat: stat.clone(),
            })
            .await?
        {
            FCall::RWStat => Ok(()),
            _ => Err(Error::No(EPROTO)),
        }
    }

    /// Release `fid`. The fid is dead on this side whether or not the
    /// server cooperates.
    pub async fn clunk(&mut self, fid: u32) -> Result<()> {
        let resp = self.rpc_idempotent(FCall::TClunk { fid }).await;
        self.fids.release(fid);
        resp.map(|_| ())
    }

    /// Remove the file `fid` names. Like clunk, this always ends the
    /// fid's lifetime.
    pub async fn remove(&mut self, fid: u32) -> Result<()> {
        let resp = self.rpc(FCall::TRemove { fid }).await;
        self.fids.release(fid);
        resp.map(|_| ())
    }

    /// Ask the server to forget the outstanding request `oldtag`. The
    /// old tag stays reserved until `Rflush` confirms; any reply to it
    /// that races ahead is dropped in [`wait`](Self::wait).
    pub async fn flush(&mut self, oldtag: u16) -> Result<()> {
        if !self.inflight.contains(&oldtag) {
            return Err(Error::No(EINVAL));
        }
        self.flushing.insert(oldtag);

        let ftag = self.submit(FCall::TFlush { oldtag }).await?;
        let resp = self.wait(ftag).await;

        // Whatever the outcome, the flushed exchange is over.
        self.flushing.remove(&oldtag);
        self.pending.remove(&oldtag);
        if self.inflight.remove(&oldtag) {
            self.tags.release(oldtag);
        }

        match resp? {
            FCall::RFlush => Ok(()),
            _ => Err(Error::No(EPROTO)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    type ServerSide = Framed<UnixStream, LengthDelimitedCodec>;

    fn server_frame(stream: UnixStream) -> ServerSide {
        LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_framed(stream)
    }

    async fn server_recv(framed: &mut ServerSide) -> Msg {
        let bytes = framed.next().await.unwrap().unwrap();
        Decodable::decode(&mut bytes.reader()).unwrap()
    }

    async fn server_send(framed: &mut ServerSide, msg: Msg) {
        let mut writer = BytesMut::new().writer();
        msg.encode(&mut writer).unwrap();
        framed.send(writer.into_inner().freeze()).await.unwrap();
    }

    fn dir_qid() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 1,
            path: 1,
        }
    }

    #[tokio::test]
    async fn version_handshake_agrees_on_minimum() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);
            let msg = server_recv(&mut framed).await;
            assert_eq!(msg.tag, NOTAG);
            assert_eq!(
                msg.body,
                FCall::TVersion {
                    msize: 8192,
                    version: P92000.to_owned(),
                }
            );
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 4096,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;
        });

        let msize = conv.version(8192).await.unwrap();
        assert_eq!(msize, 4096);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn version_downgrade_is_refused() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);
            let _ = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 0,
                        version: VERSION_UNKNOWN.to_owned(),
                    },
                },
            )
            .await;
        });

        let err = conv.version(8192).await.unwrap_err();
        assert_eq!(err.errno(), EPROTONOSUPPORT);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn attach_and_walk() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);

            let msg = server_recv(&mut framed).await;
            assert!(matches!(msg.body, FCall::TVersion { .. }));
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 8192,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;

            let msg = server_recv(&mut framed).await;
            match msg.body {
                FCall::TAttach {
                    fid,
                    afid,
                    ref uname,
                    ref aname,
                } => {
                    assert_eq!(fid, 0);
                    assert_eq!(afid, NOFID);
                    assert_eq!(uname, "alice");
                    assert_eq!(aname, "");
                }
                other => panic!("expected TAttach, got {:?}", other),
            }
            server_send(
                &mut framed,
                Msg {
                    tag: msg.tag,
                    body: FCall::RAttach { qid: dir_qid() },
                },
            )
            .await;

            let msg = server_recv(&mut framed).await;
            match msg.body {
                FCall::TWalk {
                    fid,
                    newfid,
                    ref wnames,
                } => {
                    assert_eq!(fid, 0);
                    assert_eq!(newfid, 1);
                    assert_eq!(wnames, &["usr".to_owned(), "bin".to_owned()]);
                }
                other => panic!("expected TWalk, got {:?}", other),
            }
            server_send(
                &mut framed,
                Msg {
                    tag: msg.tag,
                    body: FCall::RWalk {
                        wqids: vec![dir_qid(), dir_qid()],
                    },
                },
            )
            .await;
        });

        conv.version(8192).await.unwrap();
        let (root, qid) = conv.attach(NOFID, "alice", "").await.unwrap();
        assert_eq!(root, 0);
        assert_eq!(qid, dir_qid());

        let (newfid, qids) = conv
            .walk(root, &["usr".to_owned(), "bin".to_owned()])
            .await
            .unwrap();
        assert_eq!(newfid, 1);
        assert_eq!(qids.len(), 2);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn flush_discards_raced_reply() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);

            let _ = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 8192,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;

            let attach = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: attach.tag,
                    body: FCall::RAttach { qid: dir_qid() },
                },
            )
            .await;

            let read = server_recv(&mut framed).await;
            assert!(matches!(read.body, FCall::TRead { .. }));
            let flush = server_recv(&mut framed).await;
            let oldtag = match flush.body {
                FCall::TFlush { oldtag } => oldtag,
                other => panic!("expected TFlush, got {:?}", other),
            };
            assert_eq!(oldtag, read.tag);

            // the read's reply races ahead of the flush confirmation
            server_send(
                &mut framed,
                Msg {
                    tag: read.tag,
                    body: FCall::RRead {
                        data: Data(b"stale".to_vec()),
                    },
                },
            )
            .await;
            server_send(
                &mut framed,
                Msg {
                    tag: flush.tag,
                    body: FCall::RFlush,
                },
            )
            .await;

            // the conversation must still be usable afterwards
            let stat = server_recv(&mut framed).await;
            assert!(matches!(stat.body, FCall::TStat { .. }));
            server_send(
                &mut framed,
                Msg {
                    tag: stat.tag,
                    body: FCall::RStat {
                        stat: Stat {
                            name: "/".to_owned(),
                            qid: dir_qid(),
                            ..Stat::default()
                        },
                    },
                },
            )
            .await;
        });

        conv.version(8192).await.unwrap();
        let (root, _) = conv.attach(NOFID, "alice", "").await.unwrap();

        let tag = conv
            .submit(FCall::TRead {
                fid: root,
                offset: 0,
                count: 128,
            })
            .await
            .unwrap();
        conv.flush(tag).await.unwrap();

        let stat = conv.stat(root).await.unwrap();
        assert_eq!(stat.name, "/");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn rerror_maps_to_errno_and_releases_fid() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);

            let _ = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 8192,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;

            let attach = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: attach.tag,
                    body: FCall::RAttach { qid: dir_qid() },
                },
            )
            .await;

            let walk = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: walk.tag,
                    body: FCall::RError {
                        ename: crate::error::string::ENOENT_FILE.to_owned(),
                    },
                },
            )
            .await;

            // a later walk must see the released fid again
            let walk = server_recv(&mut framed).await;
            match walk.body {
                FCall::TWalk { newfid, .. } => assert_eq!(newfid, 1),
                other => panic!("expected TWalk, got {:?}", other),
            }
            server_send(
                &mut framed,
                Msg {
                    tag: walk.tag,
                    body: FCall::RWalk {
                        wqids: vec![dir_qid()],
                    },
                },
            )
            .await;
        });

        conv.version(8192).await.unwrap();
        let (root, _) = conv.attach(NOFID, "alice", "").await.unwrap();

        let err = conv
            .walk(root, &["missing".to_owned()])
            .await
            .unwrap_err();
        assert_eq!(err.errno(), ENOENT);

        let (newfid, _) = conv.walk(root, &["there".to_owned()]).await.unwrap();
        assert_eq!(newfid, 1);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn clunk_releases_fid_even_on_server_error() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);

            let _ = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 8192,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;

            let attach = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: attach.tag,
                    body: FCall::RAttach { qid: dir_qid() },
                },
            )
            .await;

            let clunk = server_recv(&mut framed).await;
            assert!(matches!(clunk.body, FCall::TClunk { fid: 0 }));
            server_send(
                &mut framed,
                Msg {
                    tag: clunk.tag,
                    body: FCall::RError {
                        ename: crate::error::string::EBADF2.to_owned(),
                    },
                },
            )
            .await;

            // fid 0 must be available for reuse
            let attach = server_recv(&mut framed).await;
            match attach.body {
                FCall::TAttach { fid, .. } => assert_eq!(fid, 0),
                other => panic!("expected TAttach, got {:?}", other),
            }
            server_send(
                &mut framed,
                Msg {
                    tag: attach.tag,
                    body: FCall::RAttach { qid: dir_qid() },
                },
            )
            .await;
        });

        conv.version(8192).await.unwrap();
        let (root, _) = conv.attach(NOFID, "alice", "").await.unwrap();

        let err = conv.clunk(root).await.unwrap_err();
        assert_eq!(err.errno(), EBADF);

        let (fid, _) = conv.attach(NOFID, "alice", "other").await.unwrap();
        assert_eq!(fid, 0);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_state_requests_are_rejected() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        // nothing but Tversion is legal before the handshake
        let err = conv.attach(NOFID, "alice", "").await.unwrap_err();
        assert_eq!(err.errno(), EPROTO);
        let err = conv.stat(0).await.unwrap_err();
        assert_eq!(err.errno(), EPROTO);
    }

    #[tokio::test]
    async fn oversized_message_is_refused_locally() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conv = Conversation::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = server_frame(server);
            let _ = server_recv(&mut framed).await;
            server_send(
                &mut framed,
                Msg {
                    tag: NOTAG,
                    body: FCall::RVersion {
                        msize: 64,
                        version: P92000.to_owned(),
                    },
                },
            )
            .await;
        });

        conv.version(8192).await.unwrap();
        let err = conv
            .attach(NOFID, &"x".repeat(128), "")
            .await
            .unwrap_err();
        assert_eq!(err.errno(), EMSGSIZE);
        peer.await.unwrap();
    }

    #[test]
    fn tags_are_unique_until_released() {
        let mut tags = TagAllocator::default();
        let mut seen = HashSet::new();
        for _ in 0..1024 {
            assert!(seen.insert(tags.acquire().unwrap()));
        }

        tags.release(7);
        assert_eq!(tags.acquire().unwrap(), 7);
    }

    #[test]
    fn tag_space_exhaustion_is_an_error() {
        let mut tags = TagAllocator::default();
        for _ in 0..NOTAG {
            tags.acquire().unwrap();
        }
        // the only remaining value would be NOTAG
        assert_eq!(tags.acquire().unwrap_err().errno(), EAGAIN);

        tags.release(42);
        assert_eq!(tags.acquire().unwrap(), 42);
    }

    #[test]
    fn fids_reuse_released_values() {
        let mut fids = FidAllocator::default();
        assert_eq!(fids.acquire().unwrap(), 0);
        assert_eq!(fids.acquire().unwrap(), 1);
        fids.release(0);
        assert_eq!(fids.acquire().unwrap(), 0);
        assert_eq!(fids.acquire().unwrap(), 2);
    }
}
