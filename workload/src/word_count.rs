//! Counts how often each word occurs in the input text.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use common::{string_from_bytes, KeyValue, MapOutput};

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let text = string_from_bytes(kv.value)?;
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_string()).collect();

    let iter = words.into_iter().map(|word| {
        Ok(KeyValue {
            key: Bytes::from(word),
            value: Bytes::from("1"),
        })
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

    let word = string_from_bytes(key)?;
    let mut out = BytesMut::with_capacity(word.len() + 24);
    out.put(format!("{} {}\n", word, count).as_bytes());
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_emits_one_pair_per_word() {
        let kv = KeyValue::new(Bytes::from("input"), Bytes::from("the cat and the hat"));
        let pairs: Vec<KeyValue> = map(kv, Bytes::new())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let keys: Vec<&[u8]> = pairs.iter().map(|kv| kv.key.as_ref()).collect();
        assert_eq!(
            keys,
            vec![&b"the"[..], b"cat", b"and", b"the", b"hat"]
        );
        assert!(pairs.iter().all(|kv| kv.value.as_ref() == b"1"));
    }

    #[test]
    fn test_reduce_sums_counts() {
        let values: Vec<Bytes> = vec![Bytes::from("1"), Bytes::from("1"), Bytes::from("3")];
        let out = reduce(
            Bytes::from("cat"),
            Box::new(values.into_iter()),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(out.as_ref(), b"cat 5\n");
    }

    #[test]
    fn test_reduce_rejects_garbage_counts() {
        let values: Vec<Bytes> = vec![Bytes::from("not-a-number")];
        assert!(reduce(
            Bytes::from("cat"),
            Box::new(values.into_iter()),
            Bytes::new()
        )
        .is_err());
    }
}
