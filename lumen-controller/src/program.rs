//! Lighting programs and the control frames the controller reserves.
//!
//! A program is an ordered list of opaque frames. The controller never
//! inspects frame contents; it only writes them to the device in order.
//! Two single-byte frames have fixed meaning on the wire and are emitted
//! by the controller itself.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One device instruction, written to the link as-is.
pub type Frame = Bytes;

/// Stage/set marker. Used as the probe when the device reports an error.
pub const STAGE_MARKER: u8 = 0x02;

/// Clears every LED. Written before switching programs mid-run.
pub const CLEAR_ALL: u8 = 0x03;

/// The single-byte stage/set frame.
pub fn stage_frame() -> Frame {
    Bytes::from_static(&[STAGE_MARKER])
}

/// The single-byte clear-all frame.
pub fn clear_all_frame() -> Frame {
    Bytes::from_static(&[CLEAR_ALL])
}

/// An ordered, immutable sequence of frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program {
    frames: Vec<Frame>,
}

impl Program {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

impl<F: Into<Frame>> FromIterator<F> for Program {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().map(Into::into).collect(),
        }
    }
}
