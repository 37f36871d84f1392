use std::collections::BTreeMap;
use serde_derive::{Deserialize, Serialize};

pub mod metadata;
pub mod pex;

// Extended-message id 0 is always the handshake itself.
pub const HANDSHAKE_ID: u8 = 0;

// Ids we assign to extensions we speak; peers address messages to us with
// these. The ids peers pick for themselves arrive in their handshake `m`.
pub const LOCAL_METADATA_ID: u8 = 1;
pub const LOCAL_PEX_ID: u8 = 2;

pub const METADATA_NAME: &str = "ut_metadata";
pub const PEX_NAME: &str = "ut_pex";

// The bencoded extension-handshake dictionary. Every key is optional on
// the wire; field order matches bencode's sorted-key requirement.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExtendedHandshake {

    // Prefers encrypted connections (0/1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<i64>,

    // Extension name -> the sender's message id for it. Id 0 in an update
    // unregisters the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<BTreeMap<String, i64>>,

    // Total size of the info dictionary in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,

    // Listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,

    // Outstanding-request queue depth the sender will tolerate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,

    // Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    // Compact address the sender sees us as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yourip: Option<serde_bytes::ByteBuf>,

}

impl ExtendedHandshake {

    // The handshake we send: our extension map plus connection settings.
    pub fn ours(config: &crate::config::Config, metadata_size: Option<usize>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(METADATA_NAME.to_string(), LOCAL_METADATA_ID as i64);
        if !config.disable_pex {
            m.insert(PEX_NAME.to_string(), LOCAL_PEX_ID as i64);
        }
        Self {
            e: Some(0),
            m: Some(m),
            metadata_size: metadata_size.map(|n| n as i64),
            p: Some(config.listen_port as i64),
            reqq: Some(config.local_reqq as i64),
            v: Some(config.client_name.clone()),
            yourip: None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("handshake dict serializes")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }
}

// Length of the bencoded value starting at the front of `buf`, if it is
// complete. Used to split a bencoded dictionary off a raw trailing payload
// (ut_metadata data messages).
pub fn bencode_len(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut depth = 0usize;
    loop {
        match buf.get(pos)? {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'i' => {
                let end = buf[pos..].iter().position(|&b| b == b'e')?;
                pos += end + 1;
            }
            b'0'..=b'9' => {
                let colon = buf[pos..].iter().position(|&b| b == b':')?;
                let len: usize = std::str::from_utf8(&buf[pos..pos + colon])
                    .ok()?
                    .parse()
                    .ok()?;
                pos += colon + 1 + len;
                if pos > buf.len() {
                    return None;
                }
            }
            b'e' => {
                depth = depth.checked_sub(1)?;
                pos += 1;
            }
            _ => return None,
        }
        if depth == 0 {
            return Some(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let config = crate::config::Config::default();
        let ours = ExtendedHandshake::ours(&config, Some(31_235));
        let bytes = ours.to_bytes();
        let back = ExtendedHandshake::from_bytes(&bytes).unwrap();

        assert_eq!(back.metadata_size, Some(31_235));
        assert_eq!(back.reqq, Some(250));
        assert_eq!(back.p, Some(6881));
        let m = back.m.unwrap();
        assert_eq!(m.get(METADATA_NAME), Some(&(LOCAL_METADATA_ID as i64)));
        assert_eq!(m.get(PEX_NAME), Some(&(LOCAL_PEX_ID as i64)));
    }

    #[test]
    fn test_handshake_tolerates_missing_keys() {
        let back = ExtendedHandshake::from_bytes(b"de").unwrap();
        assert!(back.m.is_none());
        assert!(back.metadata_size.is_none());
    }

    #[test]
    fn test_bencode_len() {
        assert_eq!(bencode_len(b"d3:fooi1ee"), Some(10));
        assert_eq!(bencode_len(b"d3:fooi1eetrailing"), Some(10));
        assert_eq!(bencode_len(b"i-42e"), Some(5));
        assert_eq!(bencode_len(b"4:spam!"), Some(6));
        assert_eq!(bencode_len(b"d3:foo"), None);
        assert_eq!(bencode_len(b"x"), None);
        assert_eq!(bencode_len(b"d1:ld2:lli5eee"), Some(14));
    }
}
