use std::{borrow::Cow, io};

use crate::{Deserialize, PartyRole, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();
const LAYER_SIZE: usize = size_of::<u32>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const SHARE_H: Header = 2;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First frame on every mesh link, announces the connecting role.
    Hello { role: PartyRole },
    /// A role reached the barrier of the given batch.
    Arrive { epoch: usize, batch: usize },
    /// Every role reached the barrier of the given batch.
    Release { epoch: usize, batch: usize },
    /// The sender failed and the computation must stop on every role.
    Abort { reason: String },
    Disconnect,
}

/// A share of one layer's tensor, tagged with the layer's position in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload<'a> {
    pub layer: u32,
    pub values: Cow<'a, [f32]>,
}

/// The application layer message exchanged between parties.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(String),
}

impl Msg<'_> {
    /// Returns a stable identifier for the message kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Arrive { .. }) => "control/arrive",
            Msg::Control(Command::Release { .. }) => "control/release",
            Msg::Control(Command::Abort { .. }) => "control/abort",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(_) => "data/share",
            Msg::Err(_) => "err",
        }
    }

    fn invalid<T>(detail: String) -> io::Result<T> {
        Err(io::Error::new(io::ErrorKind::InvalidData, detail))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(Payload { layer, values }) => {
                buf.extend_from_slice(&SHARE_H.to_be_bytes());
                buf.extend_from_slice(&layer.to_be_bytes());
                Some(bytemuck::cast_slice(values.as_ref()))
            }
        }
    }
}

impl Deserialize for Msg<'static> {
    fn deserialize(buf: &[u8]) -> io::Result<Self> {
        let Some((kind_buf, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::invalid(format!(
                "the given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        };

        match Header::from_be_bytes(*kind_buf) {
            ERR_H => {
                let text = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(text.to_owned()))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            SHARE_H => {
                let Some((layer_buf, nums)) = rest.split_first_chunk::<LAYER_SIZE>() else {
                    return Self::invalid("share frame is missing its layer index".into());
                };

                if nums.len() % size_of::<f32>() != 0 {
                    return Self::invalid(format!(
                        "share frame body of {} bytes is not a whole number of f32s",
                        nums.len()
                    ));
                }

                Ok(Self::Data(Payload {
                    layer: u32::from_be_bytes(*layer_buf),
                    values: Cow::Owned(bytemuck::pod_collect_to_vec(nums)),
                }))
            }
            kind => Self::invalid(format!("received an invalid kind header {kind}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_body(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf);
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }
        buf
    }

    #[test]
    fn share_payload_keeps_layer_and_values() {
        let values = [1.5f32, -2.0, 0.25];
        let msg = Msg::Data(Payload {
            layer: 7,
            values: Cow::Borrowed(&values[..]),
        });

        let parsed = Msg::deserialize(&frame_body(&msg)).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn control_frames_are_json() {
        let msg = Msg::Control(Command::Arrive { epoch: 1, batch: 4 });
        let body = frame_body(&msg);

        assert_eq!(&body[..HEADER_SIZE], &CONTROL_H.to_be_bytes());
        assert!(std::str::from_utf8(&body[HEADER_SIZE..]).unwrap().contains("arrive"));
    }

    #[test]
    fn ragged_share_body_is_rejected() {
        let mut body = SHARE_H.to_be_bytes().to_vec();
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&[0, 0, 0]);

        let err = Msg::deserialize(&body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_header_is_rejected() {
        let body = 9u32.to_be_bytes();
        assert!(Msg::deserialize(&body).is_err());
    }
}
