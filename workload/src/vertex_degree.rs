//! Computes the degree of each vertex in a graph, given a list of edges
//! with one `a b` pair per line.

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

use common::{string_from_bytes, KeyValue, MapOutput};

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("invalid edge list format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("invalid edge list format"))?
        .parse()?;
    Ok((a, b))
}

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let s = string_from_bytes(kv.value)?;
    let edges = s.lines().map(parse_line).collect::<Result<Vec<_>>>()?;

    let iter = edges.into_iter().flat_map(move |(a, b)| {
        [
            Ok(KeyValue {
                key: Bytes::from(a.to_string()),
                value: Bytes::from("1"),
            }),
            Ok(KeyValue {
                key: Bytes::from(b.to_string()),
                value: Bytes::from("1"),
            }),
        ]
    });
    Ok(Box::new(iter))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let mut count = 0u64;

    for value in values {
        count += string_from_bytes(value)?.parse::<u64>()?;
    }

    let vertex = string_from_bytes(key)?;
    let mut out = BytesMut::with_capacity(24);
    out.put(format!("{}, deg={}\n", vertex, count).as_bytes());
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_emits_both_endpoints() {
        let kv = KeyValue::new(Bytes::from("edges"), Bytes::from("1 2\n2 3"));
        let pairs: Vec<KeyValue> = map(kv, Bytes::new())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let keys: Vec<&[u8]> = pairs.iter().map(|kv| kv.key.as_ref()).collect();
        assert_eq!(keys, vec![&b"1"[..], b"2", b"2", b"3"]);
    }

    #[test]
    fn test_map_rejects_malformed_edges() {
        let kv = KeyValue::new(Bytes::from("edges"), Bytes::from("1\n2 3"));
        assert!(map(kv, Bytes::new()).is_err());
    }

    #[test]
    fn test_reduce_formats_degree() {
        let values: Vec<Bytes> = vec![Bytes::from("1"), Bytes::from("1")];
        let out = reduce(
            Bytes::from("2"),
            Box::new(values.into_iter()),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(out.as_ref(), b"2, deg=2\n");
    }
}
