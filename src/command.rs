use serde::Serialize;
use strum_macros::EnumString;

/// Prompt byte signalling end-of-response on the wire (`>`).
pub(crate) const RESPONSE_TERMINATOR: u8 = 0x3E;

/// Carriage return appended to every outbound command.
pub(crate) const COMMAND_TERMINATOR: u8 = 0x0D;

/// Shape of the value a command resolves with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ResponseShape {
    /// Decoded, whitespace-trimmed text.
    #[display("text")]
    Text,
    /// The concatenated payload bytes.
    #[display("bytes")]
    Bytes,
    /// The concatenated payload plus the notification chunks as they arrived.
    #[display("chunked")]
    Chunked,
}

/// A completed command response. The terminator byte never appears in any
/// shape.
#[serde_with::serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponse {
    /// Decoded text, UTF-8 with an ISO-8859-1 fallback, trimmed.
    Text(String),
    /// Concatenated payload bytes.
    Bytes(#[serde_as(as = "serde_with::hex::Hex")] Vec<u8>),
    /// Concatenated payload plus the original chunk boundaries.
    Chunked {
        #[serde_as(as = "serde_with::hex::Hex")]
        flat: Vec<u8>,
        #[serde_as(as = "Vec<serde_with::hex::Hex>")]
        chunks: Vec<Vec<u8>>,
    },
}

/// Encodes an outbound command: the ASCII text followed by exactly one
/// carriage return.
#[must_use]
pub(crate) fn encode_command(command: &str) -> Vec<u8> {
    let mut payload = command.as_bytes().to_vec();
    payload.push(COMMAND_TERMINATOR);
    payload
}

/// Collects inbound notification payloads for the in-flight command,
/// preserving packet boundaries, until the terminator byte arrives.
#[derive(Debug, Default)]
pub(crate) struct ChunkAccumulator {
    chunks: Vec<Vec<u8>>,
}

impl ChunkAccumulator {
    /// Absorbs one notification payload. Returns `true` once the terminator
    /// has been seen; bytes following it within the same packet are
    /// discarded, and an empty trailing chunk is not kept.
    pub(crate) fn absorb(&mut self, payload: &[u8]) -> bool {
        match payload
            .iter()
            .position(|byte| *byte == RESPONSE_TERMINATOR)
        {
            Some(0) => true,
            Some(index) => {
                self.chunks.push(payload[..index].to_vec());
                true
            }
            None => {
                self.chunks.push(payload.to_vec());
                false
            }
        }
    }

    /// Returns the collected chunks in arrival order.
    pub(crate) fn into_chunks(self) -> Vec<Vec<u8>> {
        self.chunks
    }
}

/// Assembles the chunks collected for a command into the requested shape.
pub(crate) fn shape_response(shape: ResponseShape, chunks: Vec<Vec<u8>>) -> CommandResponse {
    match shape {
        ResponseShape::Text => CommandResponse::Text(decode_text(&concat_chunks(&chunks))),
        ResponseShape::Bytes => CommandResponse::Bytes(concat_chunks(&chunks)),
        ResponseShape::Chunked => CommandResponse::Chunked {
            flat: concat_chunks(&chunks),
            chunks,
        },
    }
}

fn concat_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total = chunks.iter().map(Vec::len).sum();
    let mut flat = Vec::with_capacity(total);
    for chunk in chunks {
        flat.extend_from_slice(chunk);
    }
    flat
}

/// Decodes response bytes as UTF-8, falling back to ISO-8859-1 when the
/// payload is not valid UTF-8, and trims surrounding whitespace.
fn decode_text(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.trim().to_string(),
        Err(_) => payload
            .iter()
            .map(|byte| char::from(*byte))
            .collect::<String>()
            .trim()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn encode_appends_exactly_one_carriage_return() {
        assert_eq!(b"ATZ\r".to_vec(), encode_command("ATZ"));
        assert_eq!(b"\r".to_vec(), encode_command(""));
    }

    #[test]
    fn accumulator_preserves_chunk_boundaries() {
        let mut accumulator = ChunkAccumulator::default();

        assert!(!accumulator.absorb(&[0x34, 0x33, 0x0D]));
        assert!(accumulator.absorb(&[0x00, 0x00, 0x3E]));

        assert_eq!(
            vec![vec![0x34, 0x33, 0x0D], vec![0x00, 0x00]],
            accumulator.into_chunks()
        );
    }

    #[test]
    fn accumulator_discards_bytes_after_the_terminator() {
        let mut accumulator = ChunkAccumulator::default();

        assert!(accumulator.absorb(&[0x4F, 0x4B, 0x3E, 0x41, 0x42]));

        assert_eq!(vec![vec![0x4F, 0x4B]], accumulator.into_chunks());
    }

    #[test]
    fn accumulator_drops_empty_trailing_chunk() {
        let mut accumulator = ChunkAccumulator::default();

        assert!(!accumulator.absorb(&[0x4F, 0x4B]));
        assert!(accumulator.absorb(&[0x3E, 0xFF]));

        assert_eq!(vec![vec![0x4F, 0x4B]], accumulator.into_chunks());
    }

    #[test]
    fn accumulator_handles_terminator_as_first_byte_of_first_chunk() {
        let mut accumulator = ChunkAccumulator::default();

        assert!(accumulator.absorb(&[0x3E]));

        assert_eq!(Vec::<Vec<u8>>::new(), accumulator.into_chunks());
    }

    #[rstest]
    #[case(vec![], "")]
    #[case(vec![b"ELM327".to_vec(), b" v1.5".to_vec()], "ELM327 v1.5")]
    #[case(vec![b"\r\nOK\r\n".to_vec()], "OK")]
    fn text_shape_concatenates_and_trims(#[case] chunks: Vec<Vec<u8>>, #[case] expected: &str) {
        let response = shape_response(ResponseShape::Text, chunks);
        assert_eq!(CommandResponse::Text(expected.to_string()), response);
    }

    #[test]
    fn text_shape_falls_back_to_latin1_for_invalid_utf8() {
        let response = shape_response(ResponseShape::Text, vec![vec![0x41, 0xB0, 0x43]]);
        assert_eq!(CommandResponse::Text("A\u{B0}C".to_string()), response);
    }

    #[test]
    fn chunked_shape_concatenates_bit_for_bit() {
        let chunks = vec![vec![0x34, 0x33, 0x0D], vec![0x00, 0x00]];

        let response = shape_response(ResponseShape::Chunked, chunks.clone());

        let CommandResponse::Chunked { flat, chunks: observed } = response else {
            panic!("expected chunked response");
        };
        assert_eq!(vec![0x34, 0x33, 0x0D, 0x00, 0x00], flat);
        assert_eq!(chunks, observed);
        assert_eq!(
            flat,
            observed.iter().flatten().copied().collect::<Vec<u8>>()
        );
    }

    #[test]
    fn bytes_shape_returns_flat_payload() {
        let response = shape_response(ResponseShape::Bytes, vec![vec![0x34], vec![0x31]]);
        assert_eq!(CommandResponse::Bytes(vec![0x34, 0x31]), response);
    }

    #[rstest]
    #[case("text", ResponseShape::Text)]
    #[case("bytes", ResponseShape::Bytes)]
    #[case("chunked", ResponseShape::Chunked)]
    fn shape_parses_from_cli_labels(#[case] raw: &str, #[case] expected: ResponseShape) {
        assert_eq!(Ok(expected), raw.parse());
    }

    #[test]
    fn responses_serialize_payloads_as_hex() {
        let response = shape_response(ResponseShape::Chunked, vec![vec![0x41, 0x0D], vec![0x31]]);

        let rendered = serde_json::to_value(&response).expect("response should serialize");
        assert_eq!(
            serde_json::json!({"chunked": {"flat": "410d31", "chunks": ["410d", "31"]}}),
            rendered
        );
    }
}
