use std::io;

/// Types that can be written as the body of a single frame.
pub trait Serialize {
    /// Appends the serialized form of `self` to `buf`.
    ///
    /// # Arguments
    /// * `buf` - The output buffer, it may already hold a frame prefix.
    ///
    /// # Returns
    /// An io error if `self` can't be represented on the wire.
    fn serialize(&self, buf: &mut Vec<u8>) -> io::Result<()>;
}
