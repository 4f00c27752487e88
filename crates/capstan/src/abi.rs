//! Wire-level `wasi_snapshot_preview1` types, declared with the layout
//! macros so that reads and writes through guest memory are checked and
//! canonical. Sizes match the preview1 C ABI (`iovec` 8, `fdstat` 24,
//! `dirent` 24, `filestat` 64, `subscription` 48, `event` 32).

use bitflags::bitflags;
use capstan_layout::{layout_enum, layout_struct, Layout, LayoutError};

/// The first file descriptor handed to pre-opened mounts; 0..=2 are the
/// standard streams.
pub const FIRST_PREOPEN_FD: u32 = 3;

layout_enum! {
    pub enum Filetype: u8 {
        Unknown = 0,
        BlockDevice = 1,
        CharacterDevice = 2,
        Directory = 3,
        RegularFile = 4,
        SocketDgram = 5,
        SocketStream = 6,
        SymbolicLink = 7,
    }
}

layout_enum! {
    pub enum PreopenType: u8 {
        Dir = 0,
    }
}

layout_enum! {
    pub enum Clockid: u32 {
        Realtime = 0,
        Monotonic = 1,
        ProcessCputime = 2,
        ThreadCputime = 3,
    }
}

layout_enum! {
    pub enum Whence: u8 {
        Set = 0,
        Cur = 1,
        End = 2,
    }
}

layout_enum! {
    pub enum Eventtype: u8 {
        Clock = 0,
        FdRead = 1,
        FdWrite = 2,
    }
}

layout_struct! {
    pub struct Iovec {
        pub buf: u32,
        pub buf_len: u32,
    }
}

layout_struct! {
    pub struct Prestat {
        pub tag: PreopenType,
        pub name_len: u32,
    }
}

layout_struct! {
    pub struct Fdstat {
        pub filetype: Filetype,
        pub flags: u16,
        pub rights_base: u64,
        pub rights_inheriting: u64,
    }
}

layout_struct! {
    pub struct Dirent {
        pub next: u64,
        pub ino: u64,
        pub name_len: u32,
        pub kind: Filetype,
    }
}

layout_struct! {
    pub struct Filestat {
        pub dev: u64,
        pub ino: u64,
        pub filetype: Filetype,
        pub nlink: u64,
        pub size: u64,
        pub atim: u64,
        pub mtim: u64,
        pub ctim: u64,
    }
}

layout_struct! {
    pub struct SubscriptionClock {
        pub id: Clockid,
        pub timeout: u64,
        pub precision: u64,
        pub flags: u16,
    }
}

layout_struct! {
    pub struct SubscriptionFdReadwrite {
        pub fd: u32,
    }
}

layout_struct! {
    pub struct EventFdReadwrite {
        pub nbytes: u64,
        pub flags: u16,
    }
}

layout_struct! {
    pub struct Event {
        pub userdata: u64,
        pub errno: u16,
        pub kind: Eventtype,
        pub fd_readwrite: EventFdReadwrite,
    }
}

/// One `poll_oneoff` subscription: a tagged union of a clock wait or an fd
/// readiness wait. The tag sits behind the userdata; the payload area is
/// sized to the larger arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: u64,
    pub u: SubscriptionU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionU {
    Clock(SubscriptionClock),
    FdRead(SubscriptionFdReadwrite),
    FdWrite(SubscriptionFdReadwrite),
}

impl SubscriptionU {
    fn tag(&self) -> u8 {
        match self {
            SubscriptionU::Clock(_) => 0,
            SubscriptionU::FdRead(_) => 1,
            SubscriptionU::FdWrite(_) => 2,
        }
    }
}

const SUBSCRIPTION_PAYLOAD: u32 = {
    let clock = SubscriptionClock::SIZE;
    let fd = SubscriptionFdReadwrite::SIZE;
    if clock > fd {
        clock
    } else {
        fd
    }
};

// userdata, then the tag, then the payload at the union's alignment
const SUBSCRIPTION_PAYLOAD_OFFSET: u32 = capstan_layout::align_to(8 + 1, 8);

impl Layout for Subscription {
    const ALIGN: u32 = 8;
    const SIZE: u32 = capstan_layout::align_to(
        SUBSCRIPTION_PAYLOAD_OFFSET + SUBSCRIPTION_PAYLOAD,
        Self::ALIGN,
    );

    fn get(buf: &[u8], offset: u32) -> Result<Self, LayoutError> {
        let userdata = u64::get(buf, offset)?;
        let payload = offset + SUBSCRIPTION_PAYLOAD_OFFSET;
        let u = match u8::get(buf, offset + 8)? {
            0 => SubscriptionU::Clock(SubscriptionClock::get(buf, payload)?),
            1 => SubscriptionU::FdRead(SubscriptionFdReadwrite::get(buf, payload)?),
            2 => SubscriptionU::FdWrite(SubscriptionFdReadwrite::get(buf, payload)?),
            other => {
                return Err(LayoutError::InvalidEnum {
                    ty: "Subscription",
                    value: other as u64,
                })
            }
        };
        Ok(Self { userdata, u })
    }

    fn set(self, buf: &mut [u8], offset: u32) -> Result<(), LayoutError> {
        self.userdata.set(buf, offset)?;
        self.u.tag().set(buf, offset + 8)?;
        let payload = offset + SUBSCRIPTION_PAYLOAD_OFFSET;
        match self.u {
            SubscriptionU::Clock(c) => c.set(buf, payload),
            SubscriptionU::FdRead(f) | SubscriptionU::FdWrite(f) => f.set(buf, payload),
        }
    }
}

bitflags! {
    /// `oflags` accepted by `path_open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

bitflags! {
    /// Per-fd flags; only recognised to be rejected or cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubclockFlags: u16 {
        const ABSTIME = 1 << 0;
    }
}

bitflags! {
    /// The preview1 rights bits. The table does not enforce rights; they
    /// exist to fill `fdstat` truthfully enough for libc.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
    }
}

impl Rights {
    /// Everything, as reported in `fdstat.rights_base`.
    pub fn base() -> Rights {
        Rights::all()
    }

    /// Everything but symlink creation, as reported in
    /// `fdstat.rights_inheriting`.
    pub fn inheriting() -> Rights {
        Rights::all().difference(Rights::PATH_SYMLINK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sizes() {
        assert_eq!(Iovec::SIZE, 8);
        assert_eq!(Prestat::SIZE, 8);
        assert_eq!(Fdstat::SIZE, 24);
        assert_eq!(Dirent::SIZE, 24);
        assert_eq!(Filestat::SIZE, 64);
        assert_eq!(SubscriptionClock::SIZE, 32);
        assert_eq!(Subscription::SIZE, 48);
        assert_eq!(Event::SIZE, 32);
        assert_eq!(EventFdReadwrite::SIZE, 16);
    }

    #[test]
    fn subscription_round_trip() {
        let sub = Subscription {
            userdata: 0x1122_3344_5566_7788,
            u: SubscriptionU::Clock(SubscriptionClock {
                id: Clockid::Monotonic,
                timeout: 5_000_000,
                precision: 1_000,
                flags: SubclockFlags::ABSTIME.bits(),
            }),
        };
        let mut buf = vec![0u8; Subscription::SIZE as usize];
        sub.set(&mut buf, 0).unwrap();
        assert_eq!(Subscription::get(&buf, 0).unwrap(), sub);
        // tag behind the userdata, payload at offset 16
        assert_eq!(buf[8], 0);
        assert_eq!(u32::get(&buf, 16).unwrap(), 1);
        assert_eq!(u64::get(&buf, 24).unwrap(), 5_000_000);

        let fd_sub = Subscription {
            userdata: 9,
            u: SubscriptionU::FdRead(SubscriptionFdReadwrite { fd: 4 }),
        };
        let mut buf = vec![0u8; Subscription::SIZE as usize];
        fd_sub.set(&mut buf, 0).unwrap();
        assert_eq!(Subscription::get(&buf, 0).unwrap(), fd_sub);
    }

    #[test]
    fn filestat_field_placement() {
        let stat = Filestat {
            dev: 0,
            ino: 0,
            filetype: Filetype::RegularFile,
            nlink: 0,
            size: 21,
            atim: 1_000_000,
            mtim: 1_000_000,
            ctim: 1_000_000,
        };
        let mut buf = vec![0u8; Filestat::SIZE as usize];
        stat.set(&mut buf, 0).unwrap();
        assert_eq!(buf[16], Filetype::RegularFile as u8);
        assert_eq!(u64::get(&buf, 32).unwrap(), 21);
        assert_eq!(u64::get(&buf, 48).unwrap(), 1_000_000);
    }

    #[test]
    fn dirent_kind_at_tail() {
        let d = Dirent {
            next: 7,
            ino: 0,
            name_len: 3,
            kind: Filetype::Directory,
        };
        let mut buf = vec![0u8; Dirent::SIZE as usize];
        d.set(&mut buf, 0).unwrap();
        assert_eq!(u32::get(&buf, 16).unwrap(), 3);
        assert_eq!(buf[20], Filetype::Directory as u8);
    }

    #[test]
    fn rights_reporting() {
        assert!(Rights::base().contains(Rights::PATH_SYMLINK));
        assert!(!Rights::inheriting().contains(Rights::PATH_SYMLINK));
        assert!(Rights::inheriting().contains(Rights::PATH_OPEN));
    }
}
