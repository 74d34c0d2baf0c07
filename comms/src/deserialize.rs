use std::io;

/// Types that can be rebuilt from the body of a received frame.
pub trait Deserialize: Sized {
    /// Parses `buf` into an owned value.
    ///
    /// # Arguments
    /// * `buf` - The frame body, without its length prefix.
    ///
    /// # Returns
    /// The parsed value or an `io::Error` of kind `InvalidData`.
    fn deserialize(buf: &[u8]) -> io::Result<Self>;
}
