//! Job payload derivation for the supported miner encodings.
//!
//! Two wire layouts exist. BigHeader miners take the job as one 80-char hex
//! string (four big-endian u64 words of the pre-PoW hash followed by the
//! byte-swapped timestamp). Bitmain firmwares take the hash as an array of
//! four little-endian u64 values with the timestamp as a separate parameter,
//! and later submit their extranonce2 as a decimal integer string.

use crate::constants::BITMAIN_KEYWORDS;
use kaspa_hashes::Hash;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEncoding {
    BigHeader,
    Bitmain,
}

/// Pick the encoding from the miner agent string reported at subscribe.
pub fn detect_encoding(agent: &str) -> JobEncoding {
    if is_bitmain(agent) {
        JobEncoding::Bitmain
    } else {
        JobEncoding::BigHeader
    }
}

pub fn is_bitmain(agent: &str) -> bool {
    let agent = agent.to_lowercase();
    BITMAIN_KEYWORDS.iter().any(|&keyword| agent.contains(keyword))
}

/// Build the `mining.notify` params for one job under the given encoding.
pub fn encode_job(encoding: JobEncoding, job_id: &str, pre_pow_hash: &Hash, timestamp: u64) -> Vec<Value> {
    match encoding {
        JobEncoding::BigHeader => {
            vec![Value::String(job_id.to_string()), Value::String(big_header_payload(pre_pow_hash, timestamp))]
        }
        JobEncoding::Bitmain => {
            let words = hash_words_le(pre_pow_hash);
            vec![
                Value::String(job_id.to_string()),
                Value::Array(words.iter().map(|&w| Value::Number(w.into())).collect()),
                Value::Number(timestamp.into()),
            ]
        }
    }
}

/// 80 hex chars: 4 big-endian u64 words of the hash, then the timestamp with
/// its byte order swapped (written big-endian, read back little-endian).
fn big_header_payload(hash: &Hash, timestamp: u64) -> String {
    let bytes = hash.as_bytes();
    let mut words = [0u64; 5];
    for (i, word) in words.iter_mut().take(4).enumerate() {
        *word = u64::from_be_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
    }
    words[4] = u64::from_le_bytes(timestamp.to_be_bytes());
    format!("{:016x}{:016x}{:016x}{:016x}{:016x}", words[0], words[1], words[2], words[3], words[4])
}

/// The hash as 4 little-endian u64 values.
fn hash_words_le(hash: &Hash) -> [u64; 4] {
    let bytes = hash.as_bytes();
    let mut words = [0u64; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmain_detection() {
        assert!(is_bitmain("GodMiner/2.0.1"));
        assert!(is_bitmain("BITMAIN-KS3"));
        assert!(is_bitmain("antminer ks5"));
        assert!(!is_bitmain("IceRiverMiner/1.1"));
        assert!(!is_bitmain("BzMiner"));
        assert_eq!(detect_encoding("GodMiner"), JobEncoding::Bitmain);
        assert_eq!(detect_encoding("IceRiverMiner"), JobEncoding::BigHeader);
    }

    #[test]
    fn test_big_header_payload_shape() {
        let params = encode_job(JobEncoding::BigHeader, "a1b2", &Hash::default(), 1_700_000_000_000);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], Value::String("a1b2".to_string()));
        let payload = params[1].as_str().unwrap();
        assert_eq!(payload.len(), 80);
        // Zero hash: the first 64 chars are zeros, the tail is the swapped timestamp.
        assert_eq!(&payload[..64], "0".repeat(64));
        let expected_ts = u64::from_le_bytes(1_700_000_000_000u64.to_be_bytes());
        assert_eq!(&payload[64..], format!("{expected_ts:016x}"));
    }

    #[test]
    fn test_bitmain_payload_shape() {
        let params = encode_job(JobEncoding::Bitmain, "00ff", &Hash::default(), 12345);
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], Value::String("00ff".to_string()));
        let words = params[1].as_array().unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(params[2], Value::Number(12345.into()));
    }

    #[test]
    fn test_word_order_round_trip() {
        let hash = Hash::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, //
            0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, //
            0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
        ]);
        let le = hash_words_le(&hash);
        assert_eq!(le[0], u64::from_le_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]));

        let payload = big_header_payload(&hash, 0);
        assert!(payload.starts_with("0102030405060708"));
    }
}
