/// Types that can be written into a frame.
pub trait Serialize<'a> {
    /// Writes the header part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame buffer, already holding room for the length prefix.
    ///
    /// # Returns
    /// An optional trailing byte slice to be written after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
