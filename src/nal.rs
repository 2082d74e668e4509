//! H.264 Annex-B byte-stream segmentation.
//!
//! Turns a raw byte stream (as produced by an encoder's stdout) into a
//! sequence of NAL units, each beginning with a 4-byte start code
//! (`00 00 00 01`). Never raises on malformed input: pre-stream garbage is
//! skipped, oversize units are dropped and logged.

use bytes::Bytes;

/// Sequence parameter set.
pub const NAL_TYPE_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_TYPE_PPS: u8 = 8;
/// Instantaneous decoder refresh (keyframe) slice.
pub const NAL_TYPE_IDR: u8 = 5;
/// Non-IDR slice.
pub const NAL_TYPE_NON_IDR: u8 = 1;

const START_CODE_3: [u8; 3] = [0, 0, 1];
const START_CODE_4: [u8; 4] = [0, 0, 0, 1];

/// Returns the NAL type (low 5 bits of the first byte after the start code).
///
/// Assumes `unit` begins with a start code; callers normally pass units
/// emitted by [`Extractor`], which are always 4-byte normalized.
pub fn nal_type(unit: &[u8]) -> u8 {
	if unit.len() > 2 && unit[2] == 1 {
		unit[3] & 0x1F
	} else {
		unit[4] & 0x1F
	}
}

pub fn is_keyframe(unit: &[u8]) -> bool {
	nal_type(unit) == NAL_TYPE_IDR
}

pub fn is_sps(unit: &[u8]) -> bool {
	nal_type(unit) == NAL_TYPE_SPS
}

pub fn is_pps(unit: &[u8]) -> bool {
	nal_type(unit) == NAL_TYPE_PPS
}

/// Default soft cap on the append buffer: oldest bytes are discarded past this.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 512 * 1024;

/// Default hard cap on a single NAL unit: oversize units are dropped.
pub const DEFAULT_MAX_NAL_BYTES: usize = 4 * 1024 * 1024;

/// Stateful Annex-B extractor: append-only buffer, soft cap, hard per-unit cap.
#[derive(Debug)]
pub struct Extractor {
	buf: Vec<u8>,
	max_buffer_bytes: usize,
	max_nal_bytes: usize,
}

impl Default for Extractor {
	fn default() -> Self {
		Self::new()
	}
}

impl Extractor {
	pub fn new() -> Self {
		Self::with_limits(DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_NAL_BYTES)
	}

	pub fn with_limits(max_buffer_bytes: usize, max_nal_bytes: usize) -> Self {
		Self {
			buf: Vec::new(),
			max_buffer_bytes,
			max_nal_bytes,
		}
	}

	/// Offsets of every start code in `buf`, in order. A 3-byte and 4-byte
	/// match at the same offset is reported once, as 4-byte (the 4-byte form
	/// wins on a tie).
	fn find_start_codes(&self) -> Vec<usize> {
		let buf = &self.buf;
		let n = buf.len();
		let mut starts = Vec::new();
		let mut i = 0;
		while i < n.saturating_sub(3) {
			if buf[i] == 0 && buf[i + 1] == 0 {
				if buf[i + 2] == 1 {
					starts.push(i);
					i += 3;
					continue;
				}
				if i < n - 4 && buf[i + 2] == 0 && buf[i + 3] == 1 {
					starts.push(i);
					i += 4;
					continue;
				}
			}
			i += 1;
		}
		starts
	}

	/// Normalizes a 3-byte start code to 4-byte by prepending a zero byte.
	/// Leaves an already-4-byte-prefixed unit untouched.
	fn normalize(mut nal: Vec<u8>) -> Vec<u8> {
		let is_3byte = nal.len() >= 3 && nal[0..3] == START_CODE_3 && nal.get(3).map_or(true, |&b| b != 0);
		if is_3byte {
			nal.insert(0, 0);
		}
		nal
	}

	/// Feeds a chunk of raw bytes in, returning every NAL unit completed by it.
	pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
		if !data.is_empty() {
			self.buf.extend_from_slice(data);
			if self.buf.len() > self.max_buffer_bytes {
				let cut = self.buf.len() - self.max_buffer_bytes;
				self.buf.drain(..cut);
			}
		}

		loop {
			if self.buf.len() < 4 {
				return Vec::new();
			}

			let starts = self.find_start_codes();
			if starts.len() < 2 {
				return Vec::new();
			}

			if starts[0] != 0 {
				// Pre-stream garbage before the first start code; drop it and rescan.
				self.buf.drain(..starts[0]);
				continue;
			}

			let mut out = Vec::with_capacity(starts.len() - 1);
			for pair in starts.windows(2) {
				let (a, b) = (pair[0], pair[1]);
				let nal = Self::normalize(self.buf[a..b].to_vec());
				if nal.len() <= self.max_nal_bytes {
					out.push(Bytes::from(nal));
				} else {
					tracing::warn!(len = nal.len(), "NAL unit exceeds hard cap, dropping");
				}
			}

			// Retain from the last start code onward as the unfinished tail.
			let tail_start = *starts.last().unwrap();
			self.buf.drain(..tail_start);
			return out;
		}
	}

	/// Emits the retained tail as a single unit, if it's a plausible NAL
	/// (at least 5 bytes, begins with a start code after normalization).
	/// Call once at end-of-stream; clears the buffer either way.
	pub fn flush(&mut self) -> Vec<Bytes> {
		if self.buf.len() < 5 {
			self.buf.clear();
			return Vec::new();
		}

		let nal = Self::normalize(std::mem::take(&mut self.buf));
		if nal.len() >= 4 && nal[0..4] == START_CODE_4 {
			vec![Bytes::from(nal)]
		} else {
			Vec::new()
		}
	}
}
