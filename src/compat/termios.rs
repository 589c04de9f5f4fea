//! Cygwin/MSYS terminal ABI
//!
//! Layouts and constants come from the runtime's own headers; both runtimes
//! share them. Raw mode is described with named toggles and only turned into
//! bits here.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const NCCS: usize = 18;
pub const VMIN: usize = 9;
pub const VTIME: usize = 16;

pub const TCSANOW: i32 = 2;
pub const TIOCGWINSZ: i32 = ((b'T' as i32) << 8) | 1;

pub const O_RDONLY: i32 = 0;
pub const O_RDWR: i32 = 2;
pub const O_BINARY: i32 = 0x10000;

pub const EINTR: i32 = 4;

bitflags! {
    /// `c_iflag` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const INLCR = 0x0040;
        const ICRNL = 0x0100;
        const IXON = 0x0400;
    }

    /// `c_oflag` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        const OPOST = 0x0001;
    }

    /// `c_lflag` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        const ISIG = 0x0001;
        const ICANON = 0x0002;
        const ECHO = 0x0004;
        const IEXTEN = 0x0100;
    }
}

/// `struct termios` as laid out by the runtime
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Termios {
    pub c_iflag: u32,
    pub c_oflag: u32,
    pub c_cflag: u32,
    pub c_lflag: u32,
    pub c_line: u8,
    pub c_cc: [u8; NCCS],
    pub c_ispeed: u32,
    pub c_ospeed: u32,
}

impl Termios {
    pub fn input_flags(&self) -> InputFlags {
        InputFlags::from_bits_retain(self.c_iflag)
    }

    pub fn local_flags(&self) -> LocalFlags {
        LocalFlags::from_bits_retain(self.c_lflag)
    }

    pub fn output_flags(&self) -> OutputFlags {
        OutputFlags::from_bits_retain(self.c_oflag)
    }
}

/// `struct winsize`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

/// Raw-mode settings applied when a session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMode {
    /// Clear IXON, INLCR and ICRNL
    pub disable_input_translation: bool,
    /// Clear ICANON
    pub disable_canonical: bool,
    /// Clear ECHO
    pub disable_echo: bool,
    /// Clear IEXTEN
    pub disable_extended_processing: bool,
    /// Clear ISIG
    pub disable_signal_generation: bool,
    /// Clear OPOST
    pub disable_output_processing: bool,
    /// VMIN
    pub min_read: u8,
    /// VTIME, in tenths of a second
    pub read_timeout: u8,
}

impl Default for RawMode {
    fn default() -> Self {
        Self {
            disable_input_translation: true,
            disable_canonical: true,
            disable_echo: true,
            disable_extended_processing: true,
            disable_signal_generation: true,
            disable_output_processing: false,
            min_read: 1,
            read_timeout: 0,
        }
    }
}

impl RawMode {
    /// Every toggle on; equivalent to the runtime's `cfmakeraw`
    pub fn full() -> Self {
        Self {
            disable_output_processing: true,
            ..Self::default()
        }
    }

    /// Whether the runtime's `cfmakeraw` covers every toggle
    pub fn is_full(&self) -> bool {
        self.disable_input_translation
            && self.disable_canonical
            && self.disable_echo
            && self.disable_extended_processing
            && self.disable_signal_generation
            && self.disable_output_processing
    }

    /// Clear the selected bits and set VMIN/VTIME
    pub fn apply(&self, termios: &mut Termios) {
        let mut iflag = termios.input_flags();
        let mut oflag = termios.output_flags();
        let mut lflag = termios.local_flags();

        if self.disable_input_translation {
            iflag.remove(InputFlags::IXON | InputFlags::INLCR | InputFlags::ICRNL);
        }
        if self.disable_output_processing {
            oflag.remove(OutputFlags::OPOST);
        }
        if self.disable_canonical {
            lflag.remove(LocalFlags::ICANON);
        }
        if self.disable_echo {
            lflag.remove(LocalFlags::ECHO);
        }
        if self.disable_extended_processing {
            lflag.remove(LocalFlags::IEXTEN);
        }
        if self.disable_signal_generation {
            lflag.remove(LocalFlags::ISIG);
        }

        termios.c_iflag = iflag.bits();
        termios.c_oflag = oflag.bits();
        termios.c_lflag = lflag.bits();
        self.apply_control_chars(termios);
    }

    pub fn apply_control_chars(&self, termios: &mut Termios) {
        termios.c_cc[VMIN] = self.min_read;
        termios.c_cc[VTIME] = self.read_timeout;
    }
}
