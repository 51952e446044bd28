//! Output sinks: the `key TAB value` line format and parquet files with
//! binary key and value columns.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BinaryArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::streaming::protocol;
use crate::KeyValue;

fn kv_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("value", DataType::Binary, false),
    ]))
}

/// Write `records` to a snappy-compressed parquet file. Values are stored in
/// their wire form.
pub fn write_parquet(path: impl AsRef<Path>, records: &[KeyValue]) -> Result<()> {
    let encoded: Vec<Bytes> = records.iter().map(|kv| kv.value.encode()).collect();
    let keys = BinaryArray::from(records.iter().map(|kv| kv.key.as_ref()).collect::<Vec<&[u8]>>());
    let values = BinaryArray::from(encoded.iter().map(|v| v.as_ref()).collect::<Vec<&[u8]>>());

    let batch = RecordBatch::try_new(
        kv_schema(),
        vec![Arc::new(keys) as ArrayRef, Arc::new(values) as ArrayRef],
    )?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    // writer must be closed to write footer
    writer.close()?;
    Ok(())
}

fn binary_column<'a>(batch: &'a RecordBatch, index: usize) -> Result<&'a BinaryArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<BinaryArray>()
        .ok_or_else(|| Error::Input(format!("parquet column {index} is not binary")))
}

/// Read key/value records from the first two (binary) columns of every
/// batch in a parquet file. Values come back as [`crate::Value::Bytes`].
pub fn read_parquet(path: impl AsRef<Path>) -> Result<Vec<KeyValue>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let keys = binary_column(&batch, 0)?;
        let values = binary_column(&batch, 1)?;
        for i in 0..keys.len() {
            records.push(KeyValue::new(
                Bytes::copy_from_slice(keys.value(i)),
                Bytes::copy_from_slice(values.value(i)),
            ));
        }
    }
    Ok(records)
}

/// Write every record from `records` to `writer` in the line format.
/// Returns the number of lines written.
pub async fn write_lines<W>(mut records: mpsc::Receiver<KeyValue>, writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::new(writer);
    let mut lines = 0;
    while let Some(kv) = records.recv().await {
        out.write_all(&protocol::format_line(&kv)).await?;
        lines += 1;
    }
    out.flush().await?;
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn parquet_keeps_keys_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let records = vec![
            KeyValue::new("ball", "3"),
            KeyValue::new("bat", Bytes::from_static(&[0, 1, 2])),
        ];
        write_parquet(&path, &records).unwrap();

        let back = read_parquet(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].key, Bytes::from_static(b"ball"));
        assert_eq!(back[0].value, Value::Bytes(Bytes::from_static(b"3")));
        assert_eq!(back[1].value, Value::Bytes(Bytes::from_static(&[0, 1, 2])));
    }

    #[tokio::test]
    async fn lines_use_bare_key_for_empty_values() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(KeyValue::new("a", "1")).await.unwrap();
        tx.send(KeyValue::new("b", "")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        assert_eq!(write_lines(rx, &mut out).await.unwrap(), 2);
        assert_eq!(out, b"a\t1\nb\n");
    }
}
