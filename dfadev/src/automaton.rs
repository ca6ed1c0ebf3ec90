use std::fmt;

use crate::command::Command;
use crate::error::{Error, Result};

/// Number of states, which is also the size of the alphabet: one symbol per byte value.
pub const STATES: usize = 256;

/// Status byte of an accepting run.
pub const ACCEPT: u8 = b'Y';
/// Status byte of a rejecting run.
pub const REJECT: u8 = b'N';

/// Narrow a state or symbol index coming from the outside world.
pub fn index(value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| Error::OutOfRange(value))
}

/// The automaton store: a dense transition table, the accept set and the current state.
///
/// The table is total at all times; a freshly created or reset store maps every (state, symbol)
/// pair to state 0 and accepts nothing.
#[derive(Clone, PartialEq, Eq)]
pub struct Automaton {
    pub(crate) table: Box<[[u8; STATES]; STATES]>,
    pub(crate) accepting: [bool; STATES],
    pub(crate) current: u8,
}

impl Default for Automaton {
    fn default() -> Self {
        Automaton::new()
    }
}

impl Automaton {
    pub fn new() -> Self {
        Automaton { table: Box::new([[0; STATES]; STATES]), accepting: [false; STATES], current: 0 }
    }

    pub fn reset(&mut self) {
        for row in self.table.iter_mut() {
            row.fill(0);
        }
        self.accepting.fill(false);
        self.current = 0;
    }

    /// Set δ(p, a) = q. Nothing is touched unless all three indices are in range.
    pub fn define_transition(&mut self, p: i64, a: i64, q: i64) -> Result<()> {
        let (p, a, q) = (index(p)?, index(a)?, index(q)?);
        self.table[p as usize][a as usize] = q;
        Ok(())
    }

    pub fn mark_accepting(&mut self, p: i64) -> Result<()> {
        self.accepting[index(p)? as usize] = true;
        Ok(())
    }

    pub fn mark_rejecting(&mut self, p: i64) -> Result<()> {
        self.accepting[index(p)? as usize] = false;
        Ok(())
    }

    pub fn transition(&self, p: u8, a: u8) -> u8 {
        self.table[p as usize][a as usize]
    }

    pub fn is_final(&self, p: u8) -> bool {
        self.accepting[p as usize]
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting[self.current as usize]
    }

    /// The status byte of the run so far.
    pub fn status(&self) -> u8 {
        if self.is_accepting() { ACCEPT } else { REJECT }
    }

    // Read symbols, perform transitions.
    pub fn feed(&mut self, input: &[u8]) {
        let mut state = self.current;
        for &symbol in input {
            state = self.table[state as usize][symbol as usize];
        }
        self.current = state;
    }

    pub fn apply(&mut self, command: &Command) -> Result<()> {
        match *command {
            Command::Reset => {
                self.reset();
                Ok(())
            }
            Command::AddTransition { p, a, q } => self.define_transition(p, a, q),
            Command::Accept { p } => self.mark_accepting(p),
            Command::Reject { p } => self.mark_rejecting(p),
        }
    }

    /// Apply a batch of commands. If any of them is invalid, none is applied.
    pub fn apply_all(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            command.validate()?;
        }
        for command in commands {
            self.apply(command)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Automaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let accepting: Vec<usize> = (0..STATES).filter(|&p| self.accepting[p]).collect();
        f.debug_struct("Automaton")
            .field("current", &self.current)
            .field("accepting", &accepting)
            .finish_non_exhaustive()
    }
}
