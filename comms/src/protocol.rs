//! Frame kind headers.
//!
//! Every frame body starts with one of these big-endian `u32` values.

type HeaderType = u32;
pub const HEADER_SIZE: usize = size_of::<HeaderType>();
pub type Header = [u8; HEADER_SIZE];

const ERR_H: HeaderType = 0;
const CONTROL_H: HeaderType = 1;
const INSTRUCTION_H: HeaderType = 2;
const REPLY_H: HeaderType = 3;

pub const ERR: Header = ERR_H.to_be_bytes();
pub const CONTROL: Header = CONTROL_H.to_be_bytes();
pub const INSTRUCTION: Header = INSTRUCTION_H.to_be_bytes();
pub const REPLY: Header = REPLY_H.to_be_bytes();
