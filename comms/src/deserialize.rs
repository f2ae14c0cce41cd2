use std::io;

/// Types that can be rebuilt from the body of a single frame.
pub trait Deserialize: Sized {
    /// Parses a frame body.
    ///
    /// # Arguments
    /// * `buf` - The whole frame body, without the length prefix.
    ///
    /// # Returns
    /// The parsed value or an `InvalidData` io error.
    fn deserialize(buf: &[u8]) -> io::Result<Self>;
}
