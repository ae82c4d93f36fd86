use bytes::{Buf, Bytes, BytesMut};

/// Fixed header preceding the first unit of the video socket.
pub const HEADER_LEN: usize = 5;
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Splits an unbounded H.264 elementary stream into NAL units.
///
/// Emitted frames carry the payload between two start codes, without the start code itself. The
/// stream header is dropped once, together with anything before the first start code. A frame is
/// only cut at a start code found at least one payload byte past the previous one, so no frame is
/// ever empty, and the result does not depend on how the input was split into reads.
#[derive(Debug, Default)]
pub struct NalReframer {
    buffer: BytesMut,
    header_skipped: bool,
    synced: bool,
    scan_from: usize,
}

impl NalReframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read and returns every frame it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        if !self.header_skipped {
            if self.buffer.len() < HEADER_LEN {
                return frames;
            }
            self.buffer.advance(HEADER_LEN);
            self.header_skipped = true;
        }

        if !self.synced {
            match find_start_code(&self.buffer, 0) {
                Some(index) => {
                    self.buffer.advance(index);
                    self.synced = true;
                    self.scan_from = START_CODE.len() + 1;
                }
                None => {
                    let keep = self.buffer.len().min(START_CODE.len() - 1);
                    let drop = self.buffer.len() - keep;
                    self.buffer.advance(drop);
                    return frames;
                }
            }
        }

        while let Some(index) = find_start_code(&self.buffer, self.scan_from) {
            let mut unit = self.buffer.split_to(index);
            unit.advance(START_CODE.len());
            frames.push(unit.freeze());
            self.scan_from = START_CODE.len() + 1;
        }
        let resume = self.buffer.len().saturating_sub(START_CODE.len() - 1);
        self.scan_from = self.scan_from.max(resume);
        frames
    }

    /// Releases the unit still pending at the end of the stream, if it holds any payload.
    pub fn finish(&mut self) -> Option<Bytes> {
        if !self.synced || self.buffer.len() <= START_CODE.len() {
            self.buffer.clear();
            return None;
        }
        let mut unit = self.buffer.split();
        unit.advance(START_CODE.len());
        Some(unit.freeze())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_start_code(haystack: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + START_CODE.len() {
        return None;
    }
    haystack[from..]
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|offset| offset + from)
}
