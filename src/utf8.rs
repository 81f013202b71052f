//! UTF-8 validation for text messages and close reasons.
//!
//! The validator walks the input through Bjoern Hoehrmann's DFA. The table below holds the
//! 256 byte-to-class entries followed by the 108 state transitions (states are pre-multiplied
//! by 12, the number of classes).

/// The automaton accepted everything seen so far.
pub const UTF8_ACCEPT: u32 = 0;
/// The automaton rejected the input; it never leaves this state.
pub const UTF8_REJECT: u32 = 12;

#[rustfmt::skip]
static UTF8D: [u8; 364] = [
    // byte -> character class
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, 7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2, 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3, 11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
    // (state, class) -> state
    0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12,0,12,12,12,12,12,0,12,0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

/// Incremental validator state.
///
/// Bytes may be fed in several calls, for example one per frame of a fragmented message.
/// A sequence is valid once everything was fed and [`Utf8Validator::is_accepted`] is `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Validator {
    state: u32,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more bytes. Returns `false` as soon as the input can no longer be valid UTF-8.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            let class = UTF8D[byte as usize] as u32;
            self.state = UTF8D[(256 + self.state + class) as usize] as u32;
            if self.state == UTF8_REJECT {
                return false;
            }
        }
        true
    }

    /// `true` when the bytes fed so far end on a code point boundary.
    pub fn is_accepted(&self) -> bool {
        self.state == UTF8_ACCEPT
    }

    pub fn is_rejected(&self) -> bool {
        self.state == UTF8_REJECT
    }
}

/// Validates a complete byte string.
pub fn is_valid(bytes: &[u8]) -> bool {
    let mut validator = Utf8Validator::new();
    validator.feed(bytes) && validator.is_accepted()
}
