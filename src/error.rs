//! Define 9P error representations.
//!
//! In 9P2000, servers report errors as strings carried in `Rerror`;
//! locally everything is represented as an errno. [`errno_from_ename`]
//! bridges the two by mapping the conventional Plan 9 error strings onto
//! the closest errno.

use std::io::ErrorKind::*;
use std::{fmt, io};

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    use nix::errno::Errno;

    e.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(match e.kind() {
            NotFound => Errno::ENOENT,
            PermissionDenied => Errno::EPERM,
            ConnectionRefused => Errno::ECONNREFUSED,
            ConnectionReset => Errno::ECONNRESET,
            ConnectionAborted => Errno::ECONNABORTED,
            NotConnected => Errno::ENOTCONN,
            AddrInUse => Errno::EADDRINUSE,
            AddrNotAvailable => Errno::EADDRNOTAVAIL,
            BrokenPipe => Errno::EPIPE,
            AlreadyExists => Errno::EALREADY,
            WouldBlock => Errno::EAGAIN,
            InvalidInput => Errno::EINVAL,
            InvalidData => Errno::EPROTO,
            TimedOut => Errno::ETIMEDOUT,
            WriteZero => Errno::EAGAIN,
            Interrupted => Errno::EINTR,
            UnexpectedEof => Errno::ECONNRESET,
            OutOfMemory => Errno::ENOMEM,
            _ => Errno::EIO,
        })
}

/// Error type which is convertible to an errno.
///
/// The errno is what ultimately lands in the `ret` field of a request
/// descriptor, negated.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno
    No(nix::errno::Errno),
    /// I/O error
    Io(io::Error),
}

impl Error {
    /// Get an errno representation
    pub fn errno(&self) -> nix::errno::Errno {
        match *self {
            Error::No(e) => e,
            Error::Io(ref e) => errno_from_ioerror(e),
        }
    }

    /// The `0 or -errno` return-code convention of the request descriptor
    pub fn rc(&self) -> i32 {
        -(self.errno() as i32)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::No(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

/// Errno, error numbers
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P error strings
///
/// The conventional strings Plan 9 file servers put in `Rerror.ename`.
///
/// # Protocol
/// 9P2000
pub mod string {
    pub const EPERM: &str = "Operation not permitted";
    pub const EPERM_WSTAT: &str = "wstat prohibited";
    pub const ENOENT: &str = "No such file or directory";
    pub const ENOENT_DIR: &str = "directory entry not found";
    pub const ENOENT_FILE: &str = "file not found";
    pub const ENOENT_FILE2: &str = "file does not exist";
    pub const EIO: &str = "Input/output error";
    pub const EIO2: &str = "i/o error";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EBADF2: &str = "fid unknown or out of range";
    pub const EBADF3: &str = "bad use of fid";
    pub const EBADF4: &str = "fid already in use";
    pub const EACCES: &str = "Permission denied";
    pub const EACCES2: &str = "permission denied";
    pub const EACCES3: &str = "not owner";
    pub const EEXIST: &str = "File exists";
    pub const EEXIST2: &str = "file exists";
    pub const EEXIST3: &str = "file already exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const ENOTDIR2: &str = "not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const EINVAL2: &str = "illegal mode";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const ENOTEMPTY2: &str = "directory is not empty";
    pub const ENAMETOOLONG: &str = "File name too long";
    pub const ENAMETOOLONG2: &str = "illegal name";
    pub const ENOSPC: &str = "No space left on device";
    pub const ENOSPC2: &str = "file system is full";
    pub const EROFS: &str = "Read-only file system";
    pub const EROFS2: &str = "read only file system";
    pub const ETXTBSY: &str = "Text file busy";
    pub const ETXTBSY2: &str = "file in use";
    pub const EAGAIN: &str = "Resource temporarily unavailable";
    pub const EAGAIN2: &str = "exclusive use file already open";
    pub const EMFILE: &str = "Too many open files";
    pub const ECONNRESET: &str = "Connection reset by peer";
    pub const ECONNREFUSED: &str = "Connection refused";
    pub const ECONNREFUSED2: &str = "authentication failed";
    pub const EPROTO: &str = "Protocol error";
    pub const EPROTO2: &str = "protocol botch";
    pub const EBADMSG: &str = "Bad message";
    pub const ELOOP: &str = "Too many levels of symbolic links";
    pub const ESPIPE: &str = "Illegal seek";
    pub const ESPIPE2: &str = "bad offset in directory read";
}

/// Map an `Rerror.ename` to the closest errno. Unrecognised strings
/// become `EIO`.
pub fn errno_from_ename(ename: &str) -> nix::errno::Errno {
    use nix::errno::Errno;

    match ename {
        string::EPERM | string::EPERM_WSTAT => Errno::EPERM,
        string::ENOENT | string::ENOENT_DIR | string::ENOENT_FILE | string::ENOENT_FILE2 => {
            Errno::ENOENT
        }
        string::EIO | string::EIO2 => Errno::EIO,
        string::EBADF | string::EBADF2 | string::EBADF3 | string::EBADF4 => Errno::EBADF,
        string::EACCES | string::EACCES2 | string::EACCES3 => Errno::EACCES,
        string::EEXIST | string::EEXIST2 | string::EEXIST3 => Errno::EEXIST,
        string::ENOTDIR | string::ENOTDIR2 => Errno::ENOTDIR,
        string::EISDIR => Errno::EISDIR,
        string::EINVAL | string::EINVAL2 => Errno::EINVAL,
        string::ENOTEMPTY | string::ENOTEMPTY2 => Errno::ENOTEMPTY,
        string::ENAMETOOLONG | string::ENAMETOOLONG2 => Errno::ENAMETOOLONG,
        string::ENOSPC | string::ENOSPC2 => Errno::ENOSPC,
        string::EROFS | string::EROFS2 => Errno::EROFS,
        string::ETXTBSY | string::ETXTBSY2 => Errno::ETXTBSY,
        string::EAGAIN | string::EAGAIN2 => Errno::EAGAIN,
        string::EMFILE => Errno::EMFILE,
        string::ECONNRESET => Errno::ECONNRESET,
        string::ECONNREFUSED | string::ECONNREFUSED2 => Errno::ECONNREFUSED,
        string::EPROTO | string::EPROTO2 => Errno::EPROTO,
        string::EBADMSG => Errno::EBADMSG,
        string::ELOOP => Errno::ELOOP,
        string::ESPIPE | string::ESPIPE2 => Errno::ESPIPE,
        _ => Errno::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_err;
    use nix::errno::Errno;

    #[test]
    fn ename_mapping() {
        assert_eq!(errno_from_ename("file not found"), Errno::ENOENT);
        assert_eq!(errno_from_ename("permission denied"), Errno::EACCES);
        assert_eq!(errno_from_ename("protocol botch"), Errno::EPROTO);
        assert_eq!(errno_from_ename("some vendor specific failure"), Errno::EIO);
    }

    #[test]
    fn io_error_projection() {
        let e = Error::from(io_err!(NotFound, "gone"));
        assert_eq!(e.errno(), Errno::ENOENT);
        assert_eq!(e.rc(), -(Errno::ENOENT as i32));

        let e = Error::from(io_err!(InvalidData, "bad frame"));
        assert_eq!(e.errno(), Errno::EPROTO);
    }

    #[test]
    fn errno_passthrough() {
        let e = Error::from(Errno::ELOOP);
        assert_eq!(e.errno(), Errno::ELOOP);
        assert_eq!(e.rc(), -(Errno::ELOOP as i32));
    }
}
