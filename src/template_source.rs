//! Upstream template plumbing.
//!
//! Block templates arrive from an external fetcher process as line-delimited
//! JSON over a stream subscription; completed blocks travel the other way
//! through the same fetcher, which owns the node connection. This module
//! decodes the payloads into consensus headers, runs the feed task, and
//! provides the wire-backed [`BlockSubmitter`].

use crate::constants::{FEED_RECONNECT_DELAY, SUBMIT_ACK_TIMEOUT};
use crate::errors::{SubmitError, TemplateError};
use crate::pow::{BlockSubmitter, SubmitOutcome};
use crate::template_registry::TemplateRegistry;
use kaspa_consensus_core::header::Header;
use kaspa_consensus_core::BlueWorkType;
use kaspa_hashes::Hash;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The block header fields carried by a template payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlockHeader {
    pub version: u16,
    pub parents_by_level: Vec<Vec<String>>,
    pub hash_merkle_root: String,
    pub accepted_id_merkle_root: String,
    pub utxo_commitment: String,
    pub timestamp: u64,
    pub bits: u32,
    #[serde(default)]
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_work: String,
    pub blue_score: u64,
    pub pruning_point: String,
}

fn parse_hash(s: &str, field: &str) -> Result<Hash, TemplateError> {
    Hash::from_str(s).map_err(|e| TemplateError(format!("{field}: {e}")))
}

fn blue_work_hex(work: &BlueWorkType) -> String {
    let bytes = work.to_be_bytes();
    let trimmed: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        let encoded = hex::encode(trimmed);
        encoded.trim_start_matches('0').to_string()
    }
}

fn parse_blue_work(s: &str) -> Result<BlueWorkType, TemplateError> {
    let s = s.trim_start_matches("0x");
    let padded = if s.len() % 2 == 1 { format!("0{s}") } else { s.to_string() };
    let bytes = hex::decode(&padded).map_err(|e| TemplateError(format!("blueWork: {e}")))?;
    if bytes.len() > 24 {
        return Err(TemplateError("blueWork: value exceeds 192 bits".to_string()));
    }
    let mut buf = [0u8; 24];
    buf[24 - bytes.len()..].copy_from_slice(&bytes);
    Ok(BlueWorkType::from_be_bytes(buf))
}

impl RawBlockHeader {
    pub fn into_header(self) -> Result<Header, TemplateError> {
        let mut parents = Vec::with_capacity(self.parents_by_level.len());
        for level in &self.parents_by_level {
            let mut hashes = Vec::with_capacity(level.len());
            for parent in level {
                hashes.push(parse_hash(parent, "parentsByLevel")?);
            }
            parents.push(hashes);
        }
        Ok(Header::new_finalized(
            self.version,
            parents,
            parse_hash(&self.hash_merkle_root, "hashMerkleRoot")?,
            parse_hash(&self.accepted_id_merkle_root, "acceptedIdMerkleRoot")?,
            parse_hash(&self.utxo_commitment, "utxoCommitment")?,
            self.timestamp,
            self.bits,
            self.nonce,
            self.daa_score,
            parse_blue_work(&self.blue_work)?,
            self.blue_score,
            parse_hash(&self.pruning_point, "pruningPoint")?,
        ))
    }

    pub fn from_header(header: &Header) -> Self {
        Self {
            version: header.version,
            parents_by_level: header.parents_by_level.iter().map(|level| level.iter().map(|h| h.to_string()).collect()).collect(),
            hash_merkle_root: header.hash_merkle_root.to_string(),
            accepted_id_merkle_root: header.accepted_id_merkle_root.to_string(),
            utxo_commitment: header.utxo_commitment.to_string(),
            timestamp: header.timestamp,
            bits: header.bits,
            nonce: header.nonce,
            daa_score: header.daa_score,
            blue_work: blue_work_hex(&header.blue_work),
            blue_score: header.blue_score,
            pruning_point: header.pruning_point.to_string(),
        }
    }
}

pub fn decode_template(line: &str) -> Result<Header, TemplateError> {
    let raw: RawBlockHeader = serde_json::from_str(line).map_err(|e| TemplateError(e.to_string()))?;
    raw.into_header()
}

/// Subscribe to the template feed and push every decoded header into the
/// registry. Reconnects on loss; malformed payloads are logged and skipped
/// without touching cached state.
pub async fn run_template_feed(addr: String, registry: Arc<TemplateRegistry>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let stream = tokio::select! {
            result = TcpStream::connect(&addr) => result,
            _ = shutdown.changed() => return,
        };
        let stream = match stream {
            Ok(stream) => {
                info!("template feed connected to {}", addr);
                stream
            }
            Err(e) => {
                warn!("template feed connect to {} failed: {}", addr, e);
                tokio::time::sleep(FEED_RECONNECT_DELAY).await;
                continue;
            }
        };

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown.changed() => return,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match decode_template(line) {
                        Ok(header) => registry.on_template(header),
                        Err(e) => warn!("skipping template payload: {}", e),
                    }
                }
                Ok(None) => {
                    warn!("template feed closed by upstream, reconnecting");
                    break;
                }
                Err(e) => {
                    warn!("template feed read error: {}, reconnecting", e);
                    break;
                }
            }
        }
        tokio::time::sleep(FEED_RECONNECT_DELAY).await;
    }
}

#[derive(Debug, Deserialize)]
struct SubmitAck {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Hands finalized headers back to the fetcher for node submission. Blocks
/// are rare enough that a short-lived connection per submission keeps this
/// simple and immune to feed hiccups.
pub struct FeedSubmitter {
    addr: String,
}

impl FeedSubmitter {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl BlockSubmitter for FeedSubmitter {
    async fn submit_block(&self, header: Header) -> Result<SubmitOutcome, SubmitError> {
        let payload =
            serde_json::to_string(&RawBlockHeader::from_header(&header)).map_err(|e| SubmitError::Transport(e.to_string()))?;

        let submit = async {
            let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| SubmitError::Transport(e.to_string()))?;
            stream.write_all(payload.as_bytes()).await.map_err(|e| SubmitError::Transport(e.to_string()))?;
            stream.write_all(b"\n").await.map_err(|e| SubmitError::Transport(e.to_string()))?;

            let mut lines = BufReader::new(stream).lines();
            let line = lines
                .next_line()
                .await
                .map_err(|e| SubmitError::Transport(e.to_string()))?
                .ok_or_else(|| SubmitError::Transport("upstream closed before acking submission".to_string()))?;
            let ack: SubmitAck = serde_json::from_str(&line).map_err(|e| SubmitError::Transport(e.to_string()))?;
            debug!("block submission ack: {:?}", ack);
            if ack.accepted {
                Ok(SubmitOutcome::Accepted)
            } else {
                Ok(SubmitOutcome::Rejected(ack.reason.unwrap_or_else(|| "unspecified".to_string())))
            }
        };

        match tokio::time::timeout(SUBMIT_ACK_TIMEOUT, submit).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Transport("timed out waiting for submission ack".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> String {
        serde_json::json!({
            "version": 1,
            "parentsByLevel": [[
                "2d3acd47fdd3dcb6c32f4d1cf5a35fd9e98c4e9bc5a1b2f0e83b1a7f1a2b3c4d"
            ]],
            "hashMerkleRoot": "0000000000000000000000000000000000000000000000000000000000000001",
            "acceptedIdMerkleRoot": "0000000000000000000000000000000000000000000000000000000000000002",
            "utxoCommitment": "0000000000000000000000000000000000000000000000000000000000000003",
            "timestamp": 1_700_000_000_000u64,
            "bits": 505_527_324u32,
            "daaScore": 12_345_678u64,
            "blueWork": "1b4c8e21f3",
            "blueScore": 9_876_543u64,
            "pruningPoint": "0000000000000000000000000000000000000000000000000000000000000004"
        })
        .to_string()
    }

    #[test]
    fn test_decode_template_payload() {
        let header = decode_template(&sample_payload()).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.parents_by_level.len(), 1);
        assert_eq!(header.timestamp, 1_700_000_000_000);
        assert_eq!(header.bits, 505_527_324);
        assert_eq!(header.daa_score, 12_345_678);
        assert_eq!(header.blue_score, 9_876_543);
        assert_eq!(header.nonce, 0);
        assert_eq!(blue_work_hex(&header.blue_work), "1b4c8e21f3");
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(decode_template("not json").is_err());
        assert!(decode_template(r#"{"version":1}"#).is_err());

        let mut bad_hash: serde_json::Value = serde_json::from_str(&sample_payload()).unwrap();
        bad_hash["hashMerkleRoot"] = serde_json::Value::String("zz".to_string());
        assert!(decode_template(&bad_hash.to_string()).is_err());
    }

    #[test]
    fn test_blue_work_odd_length_hex() {
        // Leading zero nibble gets restored before decoding.
        let work = parse_blue_work("f01").unwrap();
        assert_eq!(blue_work_hex(&work), "f01");
    }

    #[test]
    fn test_header_payload_round_trip() {
        let header = decode_template(&sample_payload()).unwrap();
        let raw = RawBlockHeader::from_header(&header);
        let back = raw.into_header().unwrap();
        assert_eq!(crate::pow::header_hash(&header), crate::pow::header_hash(&back));
    }
}
