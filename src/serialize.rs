//! Serialize/deserialize 9P messages into/from binary.
//!
//! All integers are little-endian; strings are a u16 length followed by the
//! bytes, never terminated. `Msg` itself encodes and decodes *without* the
//! leading size field so it composes with length-delimited framing; the
//! [`write_msg`]/[`read_msg`] helpers produce and consume complete frames
//! including the size field.
//!
//! Malformed input is reported as an error, never a panic: truncated
//! buffers, a declared size larger than the input, unknown type codes, walk
//! lists past [`MAXWELEM`] and stat records whose declared size disagrees
//! with their contents all fail decoding cleanly.

use crate::fcall::*;
use crate::io_err;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;

macro_rules! encode {
    ( $encoder:expr, $( $x:expr ),* ) => {
        $( $x.encode(&mut *$encoder)?; )*
    }
}

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

/// Read exactly `size` bytes without trusting `size` for the allocation.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(8192));
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return Err(io_err!(InvalidData, "truncated message"));
    }
    Ok(buf)
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(io_err!(InvalidInput, "string too long for the wire"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = self.typ.bits().encode(w)?;
        bytes += self.version.encode(w)?;
        bytes += self.path.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.size();
        if size > u16::MAX as u32 {
            return Err(io_err!(InvalidInput, "stat record too large"));
        }
        encode!(
            w,
            &(size as u16),
            &self.typ,
            &self.dev,
            &self.qid,
            &self.mode,
            &self.atime,
            &self.mtime,
            &self.length,
            &self.name,
            &self.uid,
            &self.gid,
            &self.muid
        );
        Ok(size as usize + mem::size_of::<u16>())
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

// The only length-prefixed vectors in 9P2000 are walk lists, so the
// MAXWELEM cap lives here.
impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > MAXWELEM {
            return Err(io_err!(InvalidInput, "walk list exceeds MAXWELEM"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        for s in self {
            bytes += s.encode(w)?;
        }
        Ok(bytes)
    }
}

fn check_version(typ: MsgType, tag: u16, version: &str) -> Result<()> {
    if tag != NOTAG {
        return Err(io_err!(InvalidData, "version message must carry NOTAG"));
    }
    let rejected = typ == MsgType::RVersion && version == VERSION_UNKNOWN;
    if !version.starts_with("9P") && !rejected {
        return Err(io_err!(InvalidData, "malformed version string"));
    }
    Ok(())
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let typ = MsgType::from(&self.body);
        (typ as u8).encode(&mut *w)?;
        self.tag.encode(&mut *w)?;

        match self.body {
            FCall::TVersion {
                ref msize,
                ref version,
            }
            | FCall::RVersion {
                ref msize,
                ref version,
            } => {
                check_version(typ, self.tag, version)?;
                encode!(w, msize, version);
            }
            FCall::TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => {
                encode!(w, afid, uname, aname);
            }
            FCall::RAuth { ref aqid } => {
                encode!(w, aqid);
            }
            FCall::TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => {
                encode!(w, fid, afid, uname, aname);
            }
            FCall::RAttach { ref qid } => {
                encode!(w, qid);
            }
            FCall::RError { ref ename } => {
                encode!(w, ename);
            }
            FCall::TFlush { ref oldtag } => {
                encode!(w, oldtag);
            }
            FCall::RFlush => {}
            FCall::TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => {
                // Per walk(5) the path element "." is never transmitted.
                if wnames.iter().any(|n| n == ".") {
                    return Err(io_err!(InvalidInput, "walk to '.' is not allowed"));
                }
                encode!(w, fid, newfid, wnames);
            }
            FCall::RWalk { ref wqids } => {
                encode!(w, wqids);
            }
            FCall::TOpen { ref fid, ref mode } => {
                encode!(w, fid, mode);
            }
            FCall::ROpen {
                ref qid,
                ref iounit,
            }
            | FCall::RCreate {
                ref qid,
                ref iounit,
            } => {
                encode!(w, qid, iounit);
            }
            FCall::TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => {
                encode!(w, fid, name, perm, mode);
            }
            FCall::TRead {
                ref fid,
                ref offset,
                ref count,
            } => {
                encode!(w, fid, offset, count);
            }
            FCall::RRead { ref data } => {
                encode!(w, data);
            }
            FCall::TWrite {
                ref fid,
                ref offset,
                ref data,
            } => {
                encode!(w, fid, offset, data);
            }
            FCall::RWrite { ref count } => {
                encode!(w, count);
            }
            FCall::TClunk { ref fid } | FCall::TRemove { ref fid } | FCall::TStat { ref fid } => {
                encode!(w, fid);
            }
            FCall::RClunk | FCall::RRemove | FCall::RWStat => {}
            FCall::RStat { ref stat } => {
                encode!(w, stat);
            }
            FCall::TWStat { ref fid, ref stat } => {
                encode!(w, fid, stat);
            }
        };

        Ok(self.size() as usize - mem::size_of::<u32>())
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_truncate(decode!(*r)),
            version: decode!(*r),
            path: decode!(*r),
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = decode!(*r);
        let mut body = Cursor::new(read_exact(r, size as usize)?);
        let stat = Stat {
            typ: decode!(body),
            dev: decode!(body),
            qid: decode!(body),
            mode: decode!(body),
            atime: decode!(body),
            mtime: decode!(body),
            length: decode!(body),
            name: decode!(body),
            uid: decode!(body),
            gid: decode!(body),
            muid: decode!(body),
        };
        if body.position() != size as u64 {
            return Err(io_err!(InvalidData, "stat size disagrees with contents"));
        }
        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > MAXWELEM {
            return Err(io_err!(InvalidData, "walk list exceeds MAXWELEM"));
        }
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(typ @ (MsgType::TVersion | MsgType::RVersion)) => {
                let msize = decode!(buf);
                let version: String = decode!(buf);
                check_version(typ, tag, &version)?;
                if typ == MsgType::TVersion {
                    FCall::TVersion { msize, version }
                } else {
                    FCall::RVersion { msize, version }
                }
            }
            Some(MsgType::TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(MsgType::RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(MsgType::TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(MsgType::RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(MsgType::RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(MsgType::TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(MsgType::RFlush) => FCall::RFlush,
            Some(MsgType::TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(MsgType::RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(MsgType::TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(MsgType::ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(MsgType::TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(MsgType::RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(MsgType::TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(MsgType::RRead) => FCall::RRead { data: decode!(buf) },
            Some(MsgType::TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(MsgType::RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(MsgType::TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(MsgType::RClunk) => FCall::RClunk,
            Some(MsgType::TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(MsgType::RRemove) => FCall::RRemove,
            Some(MsgType::TStat) => FCall::TStat { fid: decode!(buf) },
            Some(MsgType::RStat) => FCall::RStat { stat: decode!(buf) },
            Some(MsgType::TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode!(buf),
            },
            Some(MsgType::RWStat) => FCall::RWStat,
            None => return Err(io_err!(InvalidData, "invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Read one complete 9P message, size field included, from a
/// byte-oriented stream.
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    let size = r.read_u32::<LittleEndian>()?;
    if (size as usize) < mem::size_of::<u32>() + mem::size_of::<u8>() + mem::size_of::<u16>() {
        return Err(io_err!(InvalidData, "message size below header length"));
    }
    // A declared size past the available input is an error, not a request
    // for more bytes.
    let mut body = Cursor::new(read_exact(r, size as usize - mem::size_of::<u32>())?);
    let msg: Msg = Decodable::decode(&mut body)?;
    if body.position() != body.get_ref().len() as u64 {
        return Err(io_err!(InvalidData, "message size disagrees with contents"));
    }
    Ok(msg)
}

/// Write one complete 9P message, size field included, into a
/// byte-oriented stream. Returns the number of bytes written.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    let mut body = Vec::with_capacity(msg.size() as usize);
    msg.encode(&mut body)?;
    let size = mem::size_of::<u32>() + body.len();
    (size as u32).encode(w)?;
    w.write_all(&body)?;
    Ok(size)
}
