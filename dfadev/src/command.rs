use serde::{Deserialize, Serialize};

use crate::automaton::index;
use crate::error::{Error, Result};

/// ioctl request codes of the dfa character device.
pub const DFAIOCRESET: u32 = 0x2000_6101;
pub const DFAIOCADD: u32 = 0x8003_6102;
pub const DFAIOCACCEPT: u32 = 0x8001_6103;
pub const DFAIOCREJECT: u32 = 0x8001_6104;

/// A control-plane command. Indices are kept wide until they reach the store so that
/// out-of-range values can be reported instead of silently wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Reset,
    AddTransition { p: i64, a: i64, q: i64 },
    Accept { p: i64 },
    Reject { p: i64 },
}

impl Command {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Command::Reset => Ok(()),
            Command::AddTransition { p, a, q } => {
                index(p)?;
                index(a)?;
                index(q)?;
                Ok(())
            }
            Command::Accept { p } | Command::Reject { p } => index(p).map(|_| ()),
        }
    }

    /// Decode an ioctl request and its argument buffer.
    pub fn from_ioctl(request: u32, arg: &[u8]) -> Result<Self> {
        let byte = |i: usize| {
            arg.get(i).map(|&b| b as i64).ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("ioctl {request:#010x}: argument has {} bytes", arg.len()),
                ))
            })
        };
        match request {
            DFAIOCRESET => Ok(Command::Reset),
            DFAIOCADD => Ok(Command::AddTransition { p: byte(0)?, a: byte(1)?, q: byte(2)? }),
            DFAIOCACCEPT => Ok(Command::Accept { p: byte(0)? }),
            DFAIOCREJECT => Ok(Command::Reject { p: byte(0)? }),
            _ => Err(Error::NotSupported(format!("ioctl request {request:#010x}"))),
        }
    }

    pub fn ioctl_request(&self) -> u32 {
        match self {
            Command::Reset => DFAIOCRESET,
            Command::AddTransition { .. } => DFAIOCADD,
            Command::Accept { .. } => DFAIOCACCEPT,
            Command::Reject { .. } => DFAIOCREJECT,
        }
    }
}

/// Commands that clear the whole table to 0 and reject every state, the long way round.
pub fn reset_device() -> Vec<Command> {
    let mut commands = Vec::with_capacity(256 * 257);
    for p in 0..256 {
        commands.push(Command::Reject { p });
        for a in 0..256 {
            commands.push(Command::AddTransition { p, a, q: 0 });
        }
    }
    commands
}

/// Commands configuring the automaton that accepts inputs of odd total length.
pub fn odd_length() -> Vec<Command> {
    let mut commands = reset_device();
    commands.push(Command::Reset);
    for a in 0..256 {
        commands.push(Command::AddTransition { p: 0, a, q: 1 });
    }
    commands.push(Command::Accept { p: 1 });
    commands
}
