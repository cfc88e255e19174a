//! OSC 1.0 message encoding (the subset the shell sends).
//!
//! A message is the address pattern, a type tag string starting with `,`, and
//! the arguments, each padded with NULs to a multiple of four bytes. Numbers
//! are big-endian.

use anyhow::{bail, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl OscArg {
    fn tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
        }
    }

    /// Read a command-line token: integer, then float, else string.
    /// Double quotes force a string.
    pub fn parse(token: &str) -> Self {
        if let Some(inner) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            return OscArg::Str(inner.to_string());
        }
        if let Ok(v) = token.parse::<i32>() {
            return OscArg::Int(v);
        }
        match token.parse::<f32>() {
            Ok(v) if token.contains(['.', 'e', 'E']) => OscArg::Float(v),
            _ => OscArg::Str(token.to_string()),
        }
    }
}

impl fmt::Display for OscArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OscArg::Int(v) => write!(f, "{v}"),
            OscArg::Float(v) => write!(f, "{v}"),
            OscArg::Str(v) => write!(f, "{v:?}"),
        }
    }
}

fn push_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    let pad = 4 - s.len() % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

pub fn encode_message(address: &str, args: &[OscArg]) -> Result<Vec<u8>> {
    if !address.starts_with('/') {
        bail!("OSC address must start with '/': {}", address);
    }
    if address.contains('\0') || address.contains(char::is_whitespace) {
        bail!("invalid OSC address: {:?}", address);
    }

    let mut buf = Vec::with_capacity(address.len() + 8 + args.len() * 8);
    push_padded_str(&mut buf, address);

    let tags: String = std::iter::once(',').chain(args.iter().map(OscArg::tag)).collect();
    push_padded_str(&mut buf, &tags);

    for arg in args {
        match arg {
            OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
            OscArg::Str(v) => {
                if v.contains('\0') {
                    bail!("OSC string argument contains NUL");
                }
                push_padded_str(&mut buf, v);
            }
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments() {
        assert_eq!(
            encode_message("/status", &[]).unwrap(),
            b"/status\0,\0\0\0".to_vec()
        );
        // Address of exactly four bytes still gets a full NUL word.
        assert_eq!(
            encode_message("/abc", &[]).unwrap(),
            b"/abc\0\0\0\0,\0\0\0".to_vec()
        );
    }

    #[test]
    fn test_mixed_arguments() {
        let bytes = encode_message(
            "/s_new",
            &[
                OscArg::Str("default".into()),
                OscArg::Int(1000),
                OscArg::Float(0.5),
            ],
        )
        .unwrap();
        let mut expected = b"/s_new\0\0,sif\0\0\0\0default\0".to_vec();
        expected.extend_from_slice(&[0, 0, 0x03, 0xe8]);
        expected.extend_from_slice(&[0x3f, 0, 0, 0]);
        assert_eq!(bytes, expected);
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(encode_message("status", &[]).is_err());
        assert!(encode_message("/a b", &[]).is_err());
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(OscArg::parse("42"), OscArg::Int(42));
        assert_eq!(OscArg::parse("-0.25"), OscArg::Float(-0.25));
        assert_eq!(OscArg::parse("\"7\""), OscArg::Str("7".into()));
        assert_eq!(OscArg::parse("default"), OscArg::Str("default".into()));
        assert_eq!(OscArg::parse("inf"), OscArg::Str("inf".into()));
    }
}
