//! Text renderings of raw item bytes.
//!
//! `Hex` renders every byte as two lowercase hex digits. `Print` keeps
//! printable ASCII as-is and escapes everything else as `\xx`; a literal
//! backslash is written as `\\`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Hex,
    Print,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    #[error("hex dump has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex digit {ch:?} at offset {offset}")]
    InvalidHexDigit { offset: usize, ch: char },
    #[error("unexpected character {ch:?} at offset {offset}")]
    InvalidChar { offset: usize, ch: char },
    #[error("incomplete escape sequence at offset {0}")]
    IncompleteEscape(usize),
}

impl DumpMode {
    pub fn encode(self, data: &[u8]) -> String {
        match self {
            DumpMode::Hex => to_hex(data),
            DumpMode::Print => to_print(data),
        }
    }

    pub fn decode(self, text: &str) -> Result<Vec<u8>, DumpError> {
        match self {
            DumpMode::Hex => from_hex(text),
            DumpMode::Print => from_print(text),
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn push_hex(out: &mut String, b: u8) {
    out.push(char::from(HEX_DIGITS[usize::from(b >> 4)]));
    out.push(char::from(HEX_DIGITS[usize::from(b & 0x0f)]));
}

fn hex_value(offset: usize, ch: u8) -> Result<u8, DumpError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => Err(DumpError::InvalidHexDigit {
            offset,
            ch: char::from(ch),
        }),
    }
}

pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        push_hex(&mut out, *b);
    }
    out
}

pub fn from_hex(text: &str) -> Result<Vec<u8>, DumpError> {
    let bytes = text.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(DumpError::OddLength(bytes.len()));
    }
    bytes
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| {
            let hi = hex_value(2 * i, pair[0])?;
            let lo = hex_value(2 * i + 1, pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

pub fn to_print(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                out.push('\\');
                push_hex(&mut out, b);
            }
        }
    }
    out
}

pub fn from_print(text: &str) -> Result<Vec<u8>, DumpError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => match bytes.get(i + 1) {
                Some(b'\\') => {
                    out.push(b'\\');
                    i += 2;
                }
                Some(&hi) => {
                    let lo = *bytes.get(i + 2).ok_or(DumpError::IncompleteEscape(i))?;
                    out.push((hex_value(i + 1, hi)? << 4) | hex_value(i + 2, lo)?);
                    i += 3;
                }
                None => return Err(DumpError::IncompleteEscape(i)),
            },
            b @ 0x20..=0x7e => {
                out.push(b);
                i += 1;
            }
            _ => {
                let ch = text[i..].chars().next().unwrap_or('\u{fffd}');
                return Err(DumpError::InvalidChar { offset: i, ch });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex() {
        assert_eq!(to_hex(b"\x00\x7f\xff"), "007fff");
        assert_eq!(from_hex("007FfF").unwrap(), b"\x00\x7f\xff");
        assert_eq!(from_hex("abc"), Err(DumpError::OddLength(3)));
        assert_eq!(
            from_hex("0g"),
            Err(DumpError::InvalidHexDigit { offset: 1, ch: 'g' })
        );
    }

    #[test]
    fn print() {
        let data = b"key\\1\n\xfe";
        let text = to_print(data);
        assert_eq!(text, "key\\\\1\\0a\\fe");
        assert_eq!(from_print(&text).unwrap(), data);
    }

    #[test]
    fn print_rejects_bad_escapes() {
        assert_eq!(from_print("a\\"), Err(DumpError::IncompleteEscape(1)));
        assert_eq!(from_print("\\4"), Err(DumpError::IncompleteEscape(0)));
        assert_eq!(
            from_print("\\zz"),
            Err(DumpError::InvalidHexDigit { offset: 1, ch: 'z' })
        );
        assert_eq!(
            from_print("ä"),
            Err(DumpError::InvalidChar { offset: 0, ch: 'ä' })
        );
    }
}
