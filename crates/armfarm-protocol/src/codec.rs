// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming JSONL batch encoder/decoder and validation utilities.

use serde::{Deserialize, Serialize};

use crate::{JsonlCodec, ProtocolError};

/// Streaming JSONL encoder/decoder for batch operations over any message
/// type `T` this crate defines (`SlaveRequest`, `OracleReply`, ...).
#[derive(Debug, Clone, Copy)]
pub struct StreamingCodec;

impl StreamingCodec {
    /// Encode multiple messages into a single JSONL string.
    ///
    /// Each message is serialized as one newline-terminated JSON line.
    ///
    /// # Examples
    ///
    /// ```
    /// use armfarm_protocol::{SlaveReply, codec::StreamingCodec};
    ///
    /// let replies = vec![SlaveReply::Sleep, SlaveReply::Done];
    /// let batch = StreamingCodec::encode_batch(&replies);
    /// assert_eq!(batch.lines().count(), 2);
    /// ```
    #[must_use]
    pub fn encode_batch<T: Serialize>(messages: &[T]) -> String {
        let mut out = String::new();
        for msg in messages {
            // JsonlCodec::encode already appends '\n'
            if let Ok(line) = JsonlCodec::encode(msg) {
                out.push_str(&line);
            }
        }
        out
    }

    /// Decode a JSONL string into a vec of results, one per non-blank line.
    ///
    /// Blank lines are skipped. Each non-blank line produces either a
    /// successfully parsed message or a [`ProtocolError`].
    pub fn decode_batch<T: for<'de> Deserialize<'de>>(
        input: &str,
    ) -> Vec<Result<T, ProtocolError>> {
        input
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| JsonlCodec::decode(l.trim()))
            .collect()
    }

    /// Count the number of non-blank lines in a JSONL string.
    #[must_use]
    pub fn line_count(input: &str) -> usize {
        input.lines().filter(|l| !l.trim().is_empty()).count()
    }

    /// Validate each non-blank line in a JSONL string against `T`.
    ///
    /// Returns a list of `(line_number, error)` pairs for lines that fail to
    /// parse, where `line_number` is 1-based.
    pub fn validate_jsonl<T: for<'de> Deserialize<'de>>(
        input: &str,
    ) -> Vec<(usize, ProtocolError)> {
        input
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .filter_map(|(idx, l)| JsonlCodec::decode::<T>(l.trim()).err().map(|e| (idx + 1, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlaveReply;

    #[test]
    fn batch_roundtrip() {
        let replies = vec![SlaveReply::Sleep, SlaveReply::Done, SlaveReply::Bye];
        let batch = StreamingCodec::encode_batch(&replies);
        assert_eq!(StreamingCodec::line_count(&batch), 3);
        let decoded: Vec<Result<SlaveReply, ProtocolError>> = StreamingCodec::decode_batch(&batch);
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(Result::is_ok));
    }

    #[test]
    fn validate_jsonl_reports_bad_line_numbers() {
        let input = "{\"verb\":\"SLEEP\"}\nnot json\n{\"verb\":\"DONE\"}\n";
        let errors = StreamingCodec::validate_jsonl::<SlaveReply>(input);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 2);
    }
}
