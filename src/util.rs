//! Byte helpers for locating signatures in image headers.
//!
//! Decoder applicability is decided by sniffing header bytes rather than
//! trusting a file extension or declared mime type, so disguised content
//! cannot route to the wrong decoder.

use memchr::memchr;

/// Returns `true` if `data[offset..]` starts with `bytes`.
pub fn range_equals(data: &[u8], offset: usize, bytes: &[u8]) -> bool {
  if bytes.is_empty() {
    return false;
  }
  let Some(end) = offset.checked_add(bytes.len()) else {
    return false;
  };
  if end > data.len() {
    return false;
  }
  &data[offset..end] == bytes
}

/// Index of the first occurrence of `byte` in `data[from..to]`, or `None`.
pub fn index_of_byte(data: &[u8], byte: u8, from: usize, to: usize) -> Option<usize> {
  let to = to.min(data.len());
  if from >= to {
    return None;
  }
  memchr(byte, &data[from..to]).map(|i| from + i)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn range_equals_matches_at_offset() {
    let data = b"\x89PNG\r\n\x1a\n";
    assert!(range_equals(data, 0, b"\x89PNG"));
    assert!(range_equals(data, 1, b"PNG"));
    assert!(!range_equals(data, 0, b"PNG"));
  }

  #[test]
  fn range_equals_rejects_out_of_bounds_and_empty() {
    let data = b"abc";
    assert!(!range_equals(data, 2, b"cd"));
    assert!(!range_equals(data, 3, b"a"));
    assert!(!range_equals(data, 0, b""));
  }

  #[test]
  fn index_of_byte_respects_window() {
    let data = b"aXbXc";
    assert_eq!(index_of_byte(data, b'X', 0, data.len()), Some(1));
    assert_eq!(index_of_byte(data, b'X', 2, data.len()), Some(3));
    assert_eq!(index_of_byte(data, b'X', 4, data.len()), None);
    assert_eq!(index_of_byte(data, b'X', 0, 1), None);
  }
}
