//! Length-prefixed framing for key-value records exchanged through the
//! object store. Mapper partition files and reduce inputs both use this
//! format, so keys and values may contain arbitrary bytes.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::KeyValue;

/// Append one record to the buffer.
pub fn write_record(buf: &mut BytesMut, kv: &KeyValue) {
    buf.put_u32(kv.key.len() as u32);
    buf.put_slice(&kv.key);
    buf.put_u32(kv.value.len() as u32);
    buf.put_slice(&kv.value);
}

/// Decode every record in the buffer.
pub fn read_records(data: Bytes) -> Result<Vec<KeyValue>> {
    let mut data = data;
    let mut records = Vec::new();
    while data.has_remaining() {
        let key = read_chunk(&mut data)?;
        let value = read_chunk(&mut data)?;
        records.push(KeyValue::new(key, value));
    }
    Ok(records)
}

fn read_chunk(data: &mut Bytes) -> Result<Bytes> {
    if data.remaining() < 4 {
        bail!("truncated record header");
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        bail!(
            "truncated record body: expected {len} bytes, found {}",
            data.remaining()
        );
    }
    Ok(data.copy_to_bytes(len))
}
