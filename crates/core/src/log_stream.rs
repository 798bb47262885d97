//! Line framing for build process output.
//!
//! A build container writes stdout and stderr in arbitrary chunks. The
//! [`LogMultiplexer`] keeps one remainder buffer per [`OutputChannel`] and
//! hands back only complete lines; the trailing partial line is retained
//! until more data arrives or [`LogMultiplexer::finish`] flushes it.
//!
//! Buffers hold raw bytes. Splitting happens on `\n` bytes, which never
//! occur inside a multi-byte UTF-8 sequence, so a character cut in half by
//! a chunk boundary is reassembled before it is decoded.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two process output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Std,
    Err,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Err => "err",
        }
    }

    /// Parse the stored channel name. Anything but `err` is standard output.
    pub fn from_name(name: &str) -> Self {
        if name == "err" {
            Self::Err
        } else {
            Self::Std
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel tag carried by published build events: an output stream, or the
/// synthetic terminal `finish` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventChannel {
    Std,
    Err,
    Finish,
}

impl From<OutputChannel> for EventChannel {
    fn from(channel: OutputChannel) -> Self {
        match channel {
            OutputChannel::Std => Self::Std,
            OutputChannel::Err => Self::Err,
        }
    }
}

/// Per-build line splitter for the two output channels.
#[derive(Debug, Default)]
pub struct LogMultiplexer {
    std: Vec<u8>,
    err: Vec<u8>,
}

impl LogMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to `channel` and return every line it completes.
    ///
    /// Returned lines do not include the terminating `\n`.
    pub fn push(&mut self, channel: OutputChannel, data: &[u8]) -> Vec<String> {
        let buf = self.buffer_mut(channel);
        buf.extend_from_slice(data);

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let remainder = buf.split_off(last_newline + 1);
        let ready = std::mem::replace(buf, remainder);

        // `ready` ends with '\n', so the final split element is empty.
        let mut lines: Vec<String> = ready
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();
        lines.pop();
        lines
    }

    /// The buffered partial line for `channel`, if any.
    #[cfg(test)]
    fn pending(&self, channel: OutputChannel) -> Option<String> {
        let buf = match channel {
            OutputChannel::Std => &self.std,
            OutputChannel::Err => &self.err,
        };
        (!buf.is_empty()).then(|| String::from_utf8_lossy(buf).into_owned())
    }

    /// Flush both remainders as final partial lines (standard output first)
    /// and reset the buffers. Empty remainders produce nothing.
    pub fn finish(&mut self) -> Vec<(OutputChannel, String)> {
        [OutputChannel::Std, OutputChannel::Err]
            .into_iter()
            .filter_map(|channel| {
                let buf = std::mem::take(self.buffer_mut(channel));
                (!buf.is_empty())
                    .then(|| (channel, String::from_utf8_lossy(&buf).into_owned()))
            })
            .collect()
    }

    fn buffer_mut(&mut self, channel: OutputChannel) -> &mut Vec<u8> {
        match channel {
            OutputChannel::Std => &mut self.std,
            OutputChannel::Err => &mut self.err,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
