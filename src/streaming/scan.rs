//! Line scanning with transparent decompression.

use std::io::{BufRead, BufReader, Read};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;

use super::source::Encoding;
use crate::error::{Error, Result};
use crate::store::ObjectReader;

/// Decode `reader` and send `parse(line)` for every line, raw line ending
/// included. Returns the number of lines.
///
/// Decompression runs on the blocking pool. Fails with [`Error::Closed`]
/// once `lines` has no receiver.
pub async fn scan<T, F>(
    reader: ObjectReader,
    encoding: Encoding,
    parse: F,
    lines: mpsc::Sender<T>,
) -> Result<u64>
where
    T: Send + 'static,
    F: Fn(&[u8]) -> T + Send + 'static,
{
    let bridge = SyncIoBridge::new(reader);
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let decoded: Box<dyn Read> = match encoding {
            Encoding::Identity => Box::new(bridge),
            Encoding::Gzip => Box::new(MultiGzDecoder::new(bridge)),
            Encoding::Bzip2 => Box::new(MultiBzDecoder::new(bridge)),
        };
        let mut reader = BufReader::new(decoded);
        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            lines.blocking_send(parse(&line)).map_err(|_| Error::Closed)?;
            count += 1;
        }
        Ok(count)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::parse_line;
    use crate::KeyValue;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    async fn scan_all(raw: Vec<u8>, encoding: Encoding) -> Result<Vec<KeyValue>> {
        let (tx, mut rx) = mpsc::channel(4);
        let scanning = tokio::spawn(scan(Box::pin(Cursor::new(raw)), encoding, parse_line, tx));
        let mut out = Vec::new();
        while let Some(kv) = rx.recv().await {
            out.push(kv);
        }
        scanning.await.unwrap()?;
        Ok(out)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn plain_lines() {
        let out = scan_all(b"a\t1\r\nb\t2\nlast".to_vec(), Encoding::Identity)
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![
                KeyValue::new("a", "1"),
                KeyValue::new("b", "2"),
                KeyValue::new("last", ""),
            ]
        );
    }

    #[tokio::test]
    async fn concatenated_gzip_members() {
        let mut raw = gzip(b"a\t1\n");
        raw.extend(gzip(b"b\t2\n"));
        let out = scan_all(raw, Encoding::Gzip).await.unwrap();
        assert_eq!(out, vec![KeyValue::new("a", "1"), KeyValue::new("b", "2")]);
    }

    #[tokio::test]
    async fn bzip2_lines() {
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(b"k\tv\n").unwrap();
        let raw = encoder.finish().unwrap();
        let out = scan_all(raw, Encoding::Bzip2).await.unwrap();
        assert_eq!(out, vec![KeyValue::new("k", "v")]);
    }

    #[tokio::test]
    async fn corrupt_gzip_is_an_io_error() {
        let result = scan_all(b"not gzip at all".to_vec(), Encoding::Gzip).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
