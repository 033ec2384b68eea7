//! Line codec for acknowledgments coming back from the device.
//!
//! The firmware answers each frame with one line of text. The line's
//! content is an opaque message id; `\r\n` and `\n` endings are both
//! accepted and blank lines are ignored. A line longer than
//! [`MAX_ACK_LEN`] is reported once as [`LinkEvent::Error`] and the rest
//! of it, up to the next newline, is discarded.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::LinkEvent;

/// Longest ack line accepted, excluding the terminator.
pub const MAX_ACK_LEN: usize = 256;

#[derive(Debug, Default)]
pub struct AckCodec {
    /// Inside an overlong line; skip until the next newline.
    discarding: bool,
}

impl AckCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for AckCodec {
    type Item = LinkEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = newline else {
                if src.len() > MAX_ACK_LEN {
                    let len = src.len();
                    src.clear();
                    self.discarding = true;
                    return Ok(Some(too_long(len)));
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > MAX_ACK_LEN {
                return Ok(Some(too_long(line.len())));
            }
            if line.is_empty() {
                continue;
            }

            return Ok(Some(LinkEvent::Ack { id: line.freeze() }));
        }
    }
}

fn too_long(len: usize) -> LinkEvent {
    LinkEvent::Error(format!("ack line of {} bytes exceeds {}", len, MAX_ACK_LEN))
}
