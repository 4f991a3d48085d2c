//! Script source classification and encoding.
//!
//! Script text travels in one of three shapes:
//!
//! ```text
//! plain       print(1)                      (normalized with one trailing space)
//! binary      loadstring(...) / { ... }     (byte code emitted by the instrument)
//! compressed  <COMPRESSED>base64(gzip(utf8))</COMPRESSED>
//! ```
//!
//! Classification is heuristic: a compressed script is recognized by its wrapper,
//! a binary script by the loader idiom it starts with.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bitflags::bitflags;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Marker opening a compressed script.
pub const COMPRESSED_PREFIX: &str = "<COMPRESSED>";

/// Marker closing a compressed script.
pub const COMPRESSED_SUFFIX: &str = "</COMPRESSED>";

/// Number of leading characters inspected when detecting binary scripts.
pub const CLASSIFY_WINDOW: usize = 50;

const BINARY_MARKERS: [&str; 3] = ["{", "loadstring", "loadscript"];

const LOADER_PREFIX: &str = "loadstring(table.concat(";
const LOADER_SUFFIX: &str = "))()";

bitflags! {
    /// Storage format of a script: plain text when empty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScriptFormat: u8 {
        /// Byte code produced by the instrument.
        const BINARY = 0b01;
        /// Gzip + base64 wrapped in `<COMPRESSED>` markers.
        const COMPRESSED = 0b10;
    }
}

/// Errors raised while decoding script text.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The compressed payload is not valid base64.
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The gzip stream could not be written or inflated.
    #[error("gzip stream error: {0}")]
    Gzip(#[from] std::io::Error),

    /// The inflated bytes are not UTF-8.
    #[error("decoded script is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A compression marker is missing.
    #[error("missing '{0}' marker")]
    MissingMarker(&'static str),
}

/// Result of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// Text starts with [`COMPRESSED_PREFIX`].
    pub is_compressed: bool,
    /// Text starts with a loader idiom.
    pub is_binary: bool,
}

impl Classification {
    /// Format flags matching this classification.
    pub fn format(&self) -> ScriptFormat {
        let mut format = ScriptFormat::empty();
        format.set(ScriptFormat::COMPRESSED, self.is_compressed);
        format.set(ScriptFormat::BINARY, self.is_binary);
        format
    }
}

/// Classifies raw script text as compressed and/or binary.
pub fn classify(text: &str) -> Classification {
    let head: String = text.chars().take(CLASSIFY_WINDOW).collect();
    let head = head.trim().to_ascii_lowercase();
    Classification {
        is_compressed: text.starts_with(COMPRESSED_PREFIX),
        is_binary: BINARY_MARKERS.iter().any(|marker| head.starts_with(marker)),
    }
}

/// Ensures the text ends with exactly one trailing space.
pub fn normalize(text: &str) -> String {
    format!("{} ", text.trim_end())
}

/// Gzips the normalized text and base64-encodes the result.
pub fn compress(text: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(normalize(text).as_bytes())?;
    let bytes = encoder.finish()?;
    Ok(BASE64_STANDARD.encode(bytes))
}

/// Decodes a base64 gzip payload, inflating until the end of the stream.
pub fn decompress(payload: &str) -> Result<String, CodecError> {
    let bytes = BASE64_STANDARD.decode(payload.trim())?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut inflated = Vec::new();
    decoder.read_to_end(&mut inflated)?;
    Ok(String::from_utf8(inflated)?)
}

/// Same as [`decompress`], for callers that only need success or failure.
pub fn try_decompress(payload: &str) -> Option<String> {
    decompress(payload).ok()
}

/// Wraps a compressed payload in the compression markers.
pub fn wrap(payload: &str) -> String {
    format!("{COMPRESSED_PREFIX}{payload}{COMPRESSED_SUFFIX}")
}

/// Extracts the payload between the compression markers (case-insensitive).
pub fn unwrap(text: &str) -> Result<String, CodecError> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let start = lower
        .find(&COMPRESSED_PREFIX.to_ascii_lowercase())
        .ok_or(CodecError::MissingMarker(COMPRESSED_PREFIX))?
        + COMPRESSED_PREFIX.len();
    let end = lower[start..]
        .find(&COMPRESSED_SUFFIX.to_ascii_lowercase())
        .ok_or(CodecError::MissingMarker(COMPRESSED_SUFFIX))?
        + start;
    Ok(text[start..end].to_string())
}

/// Decodes stored script text into normalized plain text and its detected format.
pub fn decode(text: &str) -> Result<(String, ScriptFormat), CodecError> {
    let outer = classify(text);
    let plain = if outer.is_compressed {
        decompress(&unwrap(text)?)?
    } else {
        text.to_string()
    };
    let mut format = ScriptFormat::empty();
    format.set(ScriptFormat::COMPRESSED, outer.is_compressed);
    format.set(ScriptFormat::BINARY, classify(&plain).is_binary);
    Ok((normalize(&plain), format))
}

/// Encodes plain script text for storage in the given format.
pub fn encode(text: &str, format: ScriptFormat) -> Result<String, CodecError> {
    if format.contains(ScriptFormat::COMPRESSED) {
        Ok(wrap(&compress(text)?))
    } else {
        Ok(normalize(text))
    }
}

/// Builds a `table.concat` expression that rebuilds the source line by line.
pub fn text_payload(source: &str) -> String {
    format!("table.concat({}, '\\n')", chunk_table(source))
}

/// Builds a data-queue payload that loads and executes a binary script.
pub fn loader_payload(source: &str) -> String {
    format!("{LOADER_PREFIX}{}, '\\n'{LOADER_SUFFIX}", chunk_table(source))
}

/// True when the payload was produced by [`loader_payload`].
pub fn is_loader_payload(payload: &str) -> bool {
    payload.starts_with(LOADER_PREFIX) && payload.ends_with(LOADER_SUFFIX)
}

fn chunk_table(source: &str) -> String {
    let chunks: Vec<String> = source.trim_end().lines().map(long_bracket).collect();
    format!("{{ {} }}", chunks.join(", "))
}

/// Quotes a line with the lowest Lua long-bracket level that does not occur in it.
fn long_bracket(line: &str) -> String {
    let mut level = 0;
    loop {
        let equals = "=".repeat(level);
        let close = format!("]{equals}]");
        if !line.contains(&close) {
            return format!("[{equals}[{line}{close}");
        }
        level += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_binary_loader() {
        let class = classify("loadstring(table.concat({...}))()");
        assert!(class.is_binary);
        assert!(!class.is_compressed);
    }

    #[test]
    fn test_classify_plain_text() {
        let class = classify("print(1)");
        assert!(!class.is_binary);
        assert!(!class.is_compressed);
    }

    #[test]
    fn test_classify_ignores_case_and_leading_space() {
        assert!(classify("   LoadScript isr").is_binary);
        assert!(classify("\n{ 27, 76, 117 }").is_binary);
    }

    #[test]
    fn test_classify_only_inspects_window() {
        let text = format!("{}loadstring()", " -- ".repeat(20));
        assert!(!classify(&text).is_binary);
    }

    #[test]
    fn test_classify_compressed() {
        let class = classify(&wrap("H4sIAAAA"));
        assert!(class.is_compressed);
        assert_eq!(class.format(), ScriptFormat::COMPRESSED);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize("print(1)\r\n");
        assert_eq!(once, "print(1) ");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_compress_round_trip() {
        let text = "isr = {}\nfunction isr.version() return '2.3.4000' end";
        let payload = compress(text).unwrap();
        assert_eq!(decompress(&payload).unwrap(), normalize(text));
    }

    #[test]
    fn test_wrap_unwrap() {
        assert_eq!(unwrap(&wrap("abc+/=")).unwrap(), "abc+/=");
    }

    #[test]
    fn test_unwrap_is_case_insensitive() {
        assert_eq!(unwrap("<compressed>xyz</Compressed>").unwrap(), "xyz");
    }

    #[test]
    fn test_unwrap_missing_suffix() {
        let err = unwrap("<COMPRESSED>xyz").unwrap_err();
        assert!(matches!(err, CodecError::MissingMarker(COMPRESSED_SUFFIX)));
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress("not base64 !!").is_err());
        assert!(try_decompress("aGVsbG8=").is_none());
    }

    #[test]
    fn test_decode_compressed_binary() {
        let stored = encode("loadstring('x')()", ScriptFormat::COMPRESSED).unwrap();
        let (plain, format) = decode(&stored).unwrap();
        assert_eq!(plain, "loadstring('x')() ");
        assert_eq!(format, ScriptFormat::COMPRESSED | ScriptFormat::BINARY);
    }

    #[test]
    fn test_loader_payload_shape() {
        let payload = loader_payload("{ 27, 76 }\n{ 117, 97 }");
        assert!(is_loader_payload(&payload));
        assert!(payload.contains("[[{ 27, 76 }]], [[{ 117, 97 }]]"));
    }

    #[test]
    fn test_long_bracket_escalates_level() {
        assert_eq!(long_bracket("a]]b"), "[=[a]]b]=]");
        assert_eq!(long_bracket("plain"), "[[plain]]");
    }
}
