//! Binary image of the automaton store, handed from one engine instance to the next.
//!
//! Layout: magic `DFA\x01`, generation (u64 LE), current state (u8), accept set as a 256-bit
//! bitmap, then the transition table row by row.

use crate::automaton::{Automaton, STATES};
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"DFA\x01";

const HEADER_LEN: usize = MAGIC.len() + 8 + 1;
const BITMAP_LEN: usize = STATES / 8;
pub const SNAPSHOT_LEN: usize = HEADER_LEN + BITMAP_LEN + STATES * STATES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: u64,
    pub automaton: Automaton,
}

impl Snapshot {
    pub fn encode(&self) -> Vec<u8> {
        let aut = &self.automaton;
        let mut out = Vec::with_capacity(SNAPSHOT_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.push(aut.current);
        let mut bitmap = [0u8; BITMAP_LEN];
        for (p, &accepting) in aut.accepting.iter().enumerate() {
            if accepting {
                bitmap[p / 8] |= 1 << (p % 8);
            }
        }
        out.extend_from_slice(&bitmap);
        for row in aut.table.iter() {
            out.extend_from_slice(row);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != SNAPSHOT_LEN {
            return Err(Error::CorruptSnapshot(format!(
                "expected {SNAPSHOT_LEN} bytes, got {}",
                data.len()
            )));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(Error::CorruptSnapshot("bad magic".to_string()));
        }
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&data[MAGIC.len()..MAGIC.len() + 8]);

        let mut automaton = Automaton::new();
        automaton.current = data[HEADER_LEN - 1];
        let bitmap = &data[HEADER_LEN..HEADER_LEN + BITMAP_LEN];
        for (p, accepting) in automaton.accepting.iter_mut().enumerate() {
            *accepting = bitmap[p / 8] & (1 << (p % 8)) != 0;
        }
        let table = &data[HEADER_LEN + BITMAP_LEN..];
        for (row, chunk) in automaton.table.iter_mut().zip(table.chunks_exact(STATES)) {
            row.copy_from_slice(chunk);
        }
        Ok(Snapshot { generation: u64::from_le_bytes(generation), automaton })
    }

    pub fn checksum(data: &[u8]) -> String {
        format!("{:016x}", xxhash_rust::xxh64::xxh64(data, 0))
    }
}
