//! Capstan is a `wasi_snapshot_preview1` host runtime for guests that have
//! been through the binaryen asyncify transform.
//!
//! The host filesystem behind every mount is asynchronous, but WASI is a
//! synchronous ABI. The bridge: when a WASI import cannot complete
//! immediately, the import stashes its in-flight future and asks the guest
//! to unwind its own call stack into a buffer inside linear memory. The
//! driver awaits the future, rewinds the guest, and the replayed import
//! call returns the resolved value. From the guest's point of view every
//! call was blocking.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use capstan::{Runner, WasiCtx, stream::BufferOut, virt::MemDir};
//!
//! let sandbox = MemDir::new();
//! sandbox.put_file("input.txt", b"hello\n")?;
//! let stdout = BufferOut::new();
//!
//! let ctx = WasiCtx::builder()
//!     .arg("demo")?
//!     .preopened_dir("/sandbox", sandbox)
//!     .stdout(stdout.clone())
//!     .build();
//! # let asyncified_guest: Vec<u8> = Vec::new();
//! let status = Runner::new(ctx).run(&asyncified_guest).await?;
//! assert_eq!(status, 0);
//! # Ok(())
//! # }
//! ```

#![warn(unused_import_braces)]
#![deny(trivial_numeric_casts, unused_extern_crates)]

pub mod abi;
mod asyncify;
pub mod clocks;
mod ctx;
mod dir;
mod error;
mod file;
pub mod fs;
mod path;
pub mod preview1;
mod random;
mod run;
pub mod stream;
mod table;
pub mod virt;

pub use asyncify::{StoreState, DATA_ADDR, DATA_END, DATA_START};
pub use ctx::{AbortToken, StringCollection, WasiCtx, WasiCtxBuilder};
pub use dir::OpenDirectory;
pub use error::{Errno, Error, I32Exit};
pub use file::OpenFile;
pub use random::random_ctx;
pub use run::{GuestInstance, Runner};
pub use table::{Descriptor, FdTable, Preopen};
