//! The WASI error taxonomy used by this runtime, and the crate-wide error
//! type that carries it.
//!
//! A binding either completes and reports [`Errno::Success`], or fails with
//! an [`Error`] holding an [`Errno`] somewhere in its chain. Errors with no
//! errno are host programming errors: they trap out of the whole invocation
//! instead of being reported to the guest.

use std::fmt;

/// The subset of `wasi_snapshot_preview1` error codes this runtime reports,
/// with their standard numeric assignments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[repr(u16)]
pub enum Errno {
    #[error("Success: no error")]
    Success = 0,
    #[error("Acces: permission denied")]
    Acces = 2,
    #[error("Badf: bad file descriptor")]
    Badf = 8,
    #[error("Canceled: operation canceled")]
    Canceled = 11,
    #[error("Exist: file exists")]
    Exist = 20,
    #[error("Inval: invalid argument")]
    Inval = 28,
    #[error("Isdir: is a directory")]
    Isdir = 31,
    #[error("Noent: no such file or directory")]
    Noent = 44,
    #[error("Nosys: function not supported")]
    Nosys = 52,
    #[error("Notdir: not a directory")]
    Notdir = 54,
    #[error("Notempty: directory not empty")]
    Notempty = 55,
    #[error("Notcapable: capability insufficient")]
    Notcapable = 76,
}

impl Errno {
    pub fn raw(self) -> u16 {
        self as u16
    }
}

/// An error from a WASI implementation or a filesystem collaborator.
///
/// Wraps an `anyhow::Error`; when the chain bottoms out in an [`Errno`] the
/// dispatch layer reports that code to the guest, otherwise the error traps.
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    /// An error with no errno: aborts the invocation instead of being
    /// reported to the guest.
    pub fn trap(inner: anyhow::Error) -> Self {
        Self { inner }
    }

    pub fn errno(&self) -> Option<Errno> {
        self.inner.downcast_ref::<Errno>().copied()
    }

    pub fn context<C>(self, context: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        Self {
            inner: self.inner.context(context),
        }
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    pub fn badf() -> Self {
        Errno::Badf.into()
    }
    pub fn perm() -> Self {
        Errno::Acces.into()
    }
    pub fn canceled() -> Self {
        Errno::Canceled.into()
    }
    pub fn exist() -> Self {
        Errno::Exist.into()
    }
    pub fn invalid_argument() -> Self {
        Errno::Inval.into()
    }
    pub fn is_dir() -> Self {
        Errno::Isdir.into()
    }
    pub fn not_found() -> Self {
        Errno::Noent.into()
    }
    pub fn not_supported() -> Self {
        Errno::Nosys.into()
    }
    pub fn not_dir() -> Self {
        Errno::Notdir.into()
    }
    pub fn not_empty() -> Self {
        Errno::Notempty.into()
    }
    pub fn not_capable() -> Self {
        Errno::Notcapable.into()
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self {
            inner: anyhow::Error::new(errno),
        }
    }
}

impl From<Error> for anyhow::Error {
    fn from(err: Error) -> Self {
        err.inner
    }
}

impl From<capstan_layout::LayoutError> for Error {
    fn from(err: capstan_layout::LayoutError) -> Self {
        Error::from(Errno::Inval).context(err)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::from(Errno::Inval).context(err)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::from(Errno::Inval).context(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Raised by `proc_exit`; caught only by the invocation driver, never
/// translated to an errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct I32Exit(pub i32);

impl fmt::Display for I32Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exited with status {}", self.0)
    }
}

impl std::error::Error for I32Exit {}
