use std::io;

use crate::{
    Deserialize, Serialize, envelope,
    protocol::{self, HEADER_SIZE},
    task::{TaskIns, TaskRes},
    typing::ClientId,
};

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// First message of a client on a new connection.
    Hello { client_id: ClientId },
    /// The coordinator accepted the `Hello`.
    Welcome,
    /// The client asks for its next instruction.
    Pull { client_id: ClientId },
    /// Nothing is pending for the client, it should pull again later.
    NoTask,
    /// The coordinator received the reply for `round`.
    Ack { round: u64 },
    /// The sender is closing the connection.
    Disconnect { reason: String },
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Control(Command),
    Instruction(TaskIns),
    Reply(TaskRes),
    Err(String),
}

impl Msg {
    /// A short name of the message kind, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Welcome) => "control/welcome",
            Msg::Control(Command::Pull { .. }) => "control/pull",
            Msg::Control(Command::NoTask) => "control/no_task",
            Msg::Control(Command::Ack { .. }) => "control/ack",
            Msg::Control(Command::Disconnect { .. }) => "control/disconnect",
            Msg::Instruction(_) => "instruction",
            Msg::Reply(_) => "reply",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(header: protocol::Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {}", u32::from_be_bytes(header)),
        ))
    }
}

impl Serialize for Msg {
    fn serialize(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&protocol::ERR);
                buf.extend_from_slice(e.as_bytes());
                Ok(())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&protocol::CONTROL);
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(())
            }
            Msg::Instruction(task) => {
                buf.extend_from_slice(&protocol::INSTRUCTION);
                envelope::write_task_ins(buf, task)
            }
            Msg::Reply(task) => {
                buf.extend_from_slice(&protocol::REPLY);
                envelope::write_task_res(buf, task)
            }
        }
    }
}

impl Deserialize for Msg {
    fn deserialize(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (header, rest) = buf.split_at(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(header);

        match kind {
            protocol::ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(string.to_string()))
            }
            protocol::CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            protocol::INSTRUCTION => envelope::read_task_ins(rest).map(Self::Instruction),
            protocol::REPLY => envelope::read_task_res(rest).map(Self::Reply),
            other => Self::invalid_kind(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Msg) -> Msg {
        let mut buf = Vec::new();
        msg.serialize(&mut buf).unwrap();
        Msg::deserialize(&buf).unwrap()
    }

    #[test]
    fn control_commands_are_json() {
        let msg = Msg::Control(Command::Ack { round: 7 });

        let mut buf = Vec::new();
        msg.serialize(&mut buf).unwrap();

        assert_eq!(&buf[..HEADER_SIZE], &protocol::CONTROL);
        assert_eq!(&buf[HEADER_SIZE..], br#"{"type":"ack","round":7}"#);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn error_text_survives() {
        let msg = Msg::Err("coordinator overloaded".into());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(Msg::deserialize(&[0, 0]).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Msg::deserialize(&[0, 0, 0, 42]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
