//! Big-endian binary codec helpers shared by record encodings.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read a single byte from `data` at `offset`.
pub fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

/// Read a big-endian u32 from `data` at `offset`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian u64 from `data` at `offset`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

/// Append a length-prefixed byte string.
pub fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Read a length-prefixed byte string written by [`put_bytes`].
pub fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short byte string");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

/// Encode a persisted record as a format-version byte followed by a
/// self-describing JSON body.
pub fn encode_record<T: Serialize>(version: u8, record: &T) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(record)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(version);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a record written by [`encode_record`], rejecting unknown versions.
pub fn decode_record<T: DeserializeOwned>(version: u8, data: &[u8]) -> anyhow::Result<T> {
    anyhow::ensure!(!data.is_empty(), "empty record");
    anyhow::ensure!(
        data[0] == version,
        "unknown record version {}, expected {}",
        data[0],
        version
    );
    Ok(serde_json::from_slice(&data[1..])?)
}
