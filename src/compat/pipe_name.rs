//! Pipe name classifier
//!
//! Cygwin and MSYS2 name the pipes behind a pty
//! `\{cygwin,msys}-<16 hex digits>-pty<N>-{from,to}-master`. Matching that
//! name is the only way to tell a mintty pty apart from any other pipe.

use super::MinttyKind;
use crate::Fd;

/// What `classify` extracts from a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeNameQuery {
    EnvironmentKind,
    PtyIndex,
}

/// Answer to a `PipeNameQuery`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Kind(MinttyKind),
    /// `None` unless the full pattern matched and the index fits in a `u32`
    PtyIndex(Option<u32>),
}

impl Classification {
    pub fn kind(self) -> MinttyKind {
        match self {
            Classification::Kind(kind) => kind,
            Classification::PtyIndex(_) => MinttyKind::None,
        }
    }

    pub fn pty_index(self) -> Option<u32> {
        match self {
            Classification::PtyIndex(index) => index,
            Classification::Kind(_) => None,
        }
    }
}

/// Kernel object type behind a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Invalid,
    Pipe,
    Other,
}

/// Read-only view of the OS objects behind descriptors
pub trait HandleInspector {
    fn object_kind(&self, fd: Fd) -> ObjectKind;

    /// Canonical name of the pipe, `None` if it cannot be fetched or does not
    /// fit the bounded name buffer.
    fn pipe_name(&self, fd: Fd) -> Option<String>;
}

/// A successfully matched pty pipe name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyPipe<'a> {
    pub kind: MinttyKind,
    index_digits: &'a str,
}

impl PtyPipe<'_> {
    pub fn pty_index(&self) -> Option<u32> {
        self.index_digits.parse().ok()
    }
}

const CYGWIN_PREFIX: &str = "\\cygwin-";
const MSYS_PREFIX: &str = "\\msys-";

/// Match a pipe name against the Cygwin/MSYS pty templates.
///
/// Any deviation rejects the whole name.
pub fn parse_pipe_name(name: &str) -> Option<PtyPipe<'_>> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix(CYGWIN_PREFIX) {
        (MinttyKind::Cygwin, rest)
    } else if let Some(rest) = name.strip_prefix(MSYS_PREFIX) {
        (MinttyKind::Msys, rest)
    } else {
        return None;
    };

    // Nominally 16 hex digits; the count is not enforced.
    let (hex, rest) = split_run(rest, |b| b.is_ascii_hexdigit());
    if hex.is_empty() {
        return None;
    }
    let rest = rest.strip_prefix("-pty")?;

    let (digits, tail) = split_run(rest, |b| b.is_ascii_digit());
    if digits.is_empty() {
        return None;
    }
    if tail != "-from-master" && tail != "-to-master" {
        return None;
    }

    Some(PtyPipe {
        kind,
        index_digits: digits,
    })
}

fn split_run(s: &str, pred: impl Fn(&u8) -> bool) -> (&str, &str) {
    let len = s.bytes().take_while(|b| pred(b)).count();
    s.split_at(len)
}

/// Classify an already fetched pipe name
pub fn classify_name(name: &str, query: PipeNameQuery) -> Classification {
    let matched = parse_pipe_name(name);
    match query {
        PipeNameQuery::EnvironmentKind => {
            Classification::Kind(matched.map_or(MinttyKind::None, |pipe| pipe.kind))
        }
        PipeNameQuery::PtyIndex => {
            Classification::PtyIndex(matched.and_then(|pipe| pipe.pty_index()))
        }
    }
}

/// Classify a descriptor through the given inspector
pub fn classify_with(
    inspector: &dyn HandleInspector,
    fd: Fd,
    query: PipeNameQuery,
) -> Classification {
    let not_a_pty = match query {
        PipeNameQuery::EnvironmentKind => Classification::Kind(MinttyKind::None),
        PipeNameQuery::PtyIndex => Classification::PtyIndex(None),
    };

    // Disk files, consoles and sockets are rejected before any name lookup.
    if inspector.object_kind(fd) != ObjectKind::Pipe {
        return not_a_pty;
    }

    match inspector.pipe_name(fd) {
        Some(name) => classify_name(&name, query),
        None => not_a_pty,
    }
}

/// Classify a descriptor of the current process
pub fn classify(fd: Fd, query: PipeNameQuery) -> Classification {
    classify_with(&OsInspector, fd, query)
}

/// Runtime owning `fd`, `MinttyKind::None` for anything that is not a mintty pty
pub fn mintty_kind(fd: Fd) -> MinttyKind {
    classify(fd, PipeNameQuery::EnvironmentKind).kind()
}

/// Inspector backed by the process' own descriptor table
#[derive(Debug, Clone, Copy, Default)]
pub struct OsInspector;

#[cfg(windows)]
mod os {
    use std::ffi::c_void;

    use windows::Win32::Foundation::{HANDLE, MAX_PATH};
    use windows::Win32::Storage::FileSystem::{
        FileNameInfo, GetFileInformationByHandleEx, GetFileType, FILE_NAME_INFO, FILE_TYPE_PIPE,
    };

    use super::{HandleInspector, ObjectKind, OsInspector};
    use crate::Fd;

    fn os_handle(fd: Fd) -> Option<HANDLE> {
        // -1: not open, -2: not associated with a stream
        let raw = unsafe { libc::get_osfhandle(fd) };
        if raw == -1 || raw == -2 {
            None
        } else {
            Some(HANDLE(raw as *mut c_void))
        }
    }

    impl HandleInspector for OsInspector {
        fn object_kind(&self, fd: Fd) -> ObjectKind {
            let Some(handle) = os_handle(fd) else {
                return ObjectKind::Invalid;
            };
            if unsafe { GetFileType(handle) } == FILE_TYPE_PIPE {
                ObjectKind::Pipe
            } else {
                ObjectKind::Other
            }
        }

        fn pipe_name(&self, fd: Fd) -> Option<String> {
            let handle = os_handle(fd)?;

            // FILE_NAME_INFO header plus MAX_PATH wide chars, u32-backed for alignment
            let header = std::mem::size_of::<u32>();
            let bytes = std::mem::size_of::<FILE_NAME_INFO>() + MAX_PATH as usize * 2;
            let mut buffer = vec![0u32; (bytes + 3) / 4];
            let size = (buffer.len() * 4) as u32;

            unsafe {
                GetFileInformationByHandleEx(
                    handle,
                    FileNameInfo,
                    buffer.as_mut_ptr() as *mut c_void,
                    size,
                )
                .ok()?;

                let info = buffer.as_ptr() as *const FILE_NAME_INFO;
                let capacity = (size as usize - header) / 2;
                let chars = ((*info).FileNameLength as usize / 2).min(capacity);
                let name = std::slice::from_raw_parts(
                    std::ptr::addr_of!((*info).FileName) as *const u16,
                    chars,
                );
                String::from_utf16(name).ok()
            }
        }
    }
}

#[cfg(not(windows))]
impl HandleInspector for OsInspector {
    fn object_kind(&self, _fd: Fd) -> ObjectKind {
        ObjectKind::Invalid
    }

    fn pipe_name(&self, _fd: Fd) -> Option<String> {
        None
    }
}
