/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = BYTES_IN_WORD << LOG_BITS_IN_BYTE;

// The header packs a 32-bit type id and a 32-bit size into one word.
static_assertions::const_assert_eq!(BYTES_IN_WORD, std::mem::size_of::<usize>());

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// The first address handed out to any space. Address zero is the null reference.
pub const HEAP_START: usize = 0x1000_0000;

/// Unmapped gap between two spaces, so an address just past the end of one
/// space never falls into the next one.
pub const SPACE_GUARD_BYTES: usize = 16 * BYTES_IN_PAGE;

/// Default TLAB refill size.
pub const DEFAULT_TLAB_SIZE: usize = 32 << LOG_BYTES_IN_KBYTE;

/// Objects of at least this many bytes go to the large object space by default.
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = 16 << LOG_BYTES_IN_KBYTE;

/// Default card size in bytes.
pub const DEFAULT_CARD_SIZE: usize = 512;

/// Default: do not trigger stress collections.
pub const DEFAULT_STRESS_FACTOR: usize = usize::MAX;

/// Maximum number of entries in one indirect reference table.
pub const MAX_HANDLES_PER_TABLE: usize = 64 * 1024;
