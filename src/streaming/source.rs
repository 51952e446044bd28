//! Where streaming input comes from, and how it is compressed.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use futures::TryStreamExt;
use reqwest::header::CONTENT_ENCODING;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::store::{parse_s3_url, ObjectReader, ObjectStore};

/// Compression of a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
    Bzip2,
}

impl Encoding {
    /// Guess from a file name suffix.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".gz") {
            Some(Encoding::Gzip)
        } else if name.ends_with(".bz2") {
            Some(Encoding::Bzip2)
        } else {
            None
        }
    }

    /// Read an HTTP `Content-Encoding` header value.
    pub fn from_content_encoding(header: &str) -> Option<Self> {
        match header.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "bzip2" | "x-bzip2" => Some(Encoding::Bzip2),
            "identity" => Some(Encoding::Identity),
            _ => None,
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "identity" | "none" => Ok(Encoding::Identity),
            "gzip" | "gz" => Ok(Encoding::Gzip),
            "bzip2" | "bz2" => Ok(Encoding::Bzip2),
            other => Err(Error::Input(format!("unknown encoding {other}"))),
        }
    }
}

/// A line-oriented input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(PathBuf),
    Url(String),
    Object { bucket: String, key: String },
}

impl InputSource {
    /// The name used to guess the encoding from its suffix.
    fn name(&self) -> Option<&str> {
        match self {
            InputSource::Stdin => None,
            InputSource::File(path) => path.to_str(),
            InputSource::Url(url) => Some(url.split(['?', '#']).next().unwrap_or(url)),
            InputSource::Object { key, .. } => Some(key),
        }
    }
}

impl FromStr for InputSource {
    type Err = Error;

    /// `-` is stdin, `http(s)://` a URL, `s3://bucket/key` an object, and
    /// anything else a local path.
    fn from_str(s: &str) -> Result<Self> {
        if s == "-" {
            Ok(InputSource::Stdin)
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Ok(InputSource::Url(s.to_string()))
        } else if s.starts_with("s3://") {
            let (bucket, key) = parse_s3_url(s)?;
            Ok(InputSource::Object { bucket, key })
        } else if s.is_empty() {
            Err(Error::Input(s.to_string()))
        } else {
            Ok(InputSource::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Stdin => write!(f, "-"),
            InputSource::File(path) => write!(f, "{}", path.display()),
            InputSource::Url(url) => write!(f, "{url}"),
            InputSource::Object { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// Opens sources as byte streams.
#[derive(Clone, Default)]
pub struct Fetcher {
    http: reqwest::Client,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Fetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `s3://` sources from `store`.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Open `source`, returning its raw bytes and their encoding.
    ///
    /// The encoding is `hint` if given, otherwise guessed from the name's
    /// suffix, otherwise taken from the `Content-Encoding` of a response.
    pub async fn open(
        &self,
        source: &InputSource,
        hint: Option<Encoding>,
    ) -> Result<(ObjectReader, Encoding)> {
        let named = hint.or_else(|| source.name().and_then(Encoding::from_name));
        trace!(%source, ?named, "opening source");
        match source {
            InputSource::Stdin => Ok((Box::pin(tokio::io::stdin()), named.unwrap_or_default())),
            InputSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok((Box::pin(file), named.unwrap_or_default()))
            }
            InputSource::Url(url) => {
                let response = self.http.get(url).send().await?.error_for_status()?;
                let header = response
                    .headers()
                    .get(CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .and_then(Encoding::from_content_encoding);
                debug!(%url, status = %response.status(), ?header, "fetching");
                let body = response.bytes_stream().map_err(std::io::Error::other);
                Ok((
                    Box::pin(StreamReader::new(body)),
                    named.or(header).unwrap_or_default(),
                ))
            }
            InputSource::Object { bucket, key } => {
                let store = self.store.as_ref().ok_or_else(|| {
                    Error::Config(format!("no object store configured to read {source}"))
                })?;
                let body = store.get(bucket, key).await?;
                Ok((body, named.unwrap_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    #[test]
    fn sources_parse_by_scheme() {
        assert_eq!("-".parse::<InputSource>().unwrap(), InputSource::Stdin);
        assert_eq!(
            "https://host/a.gz".parse::<InputSource>().unwrap(),
            InputSource::Url("https://host/a.gz".into())
        );
        assert_eq!(
            "s3://b/k/x.bz2".parse::<InputSource>().unwrap(),
            InputSource::Object {
                bucket: "b".into(),
                key: "k/x.bz2".into()
            }
        );
        assert_eq!(
            "part-0000".parse::<InputSource>().unwrap(),
            InputSource::File("part-0000".into())
        );
    }

    #[test]
    fn encoding_guesses() {
        assert_eq!(Encoding::from_name("a/b.gz"), Some(Encoding::Gzip));
        assert_eq!(Encoding::from_name("b.bz2"), Some(Encoding::Bzip2));
        assert_eq!(Encoding::from_name("b.txt"), None);
        assert_eq!(Encoding::from_content_encoding("GZIP"), Some(Encoding::Gzip));
        assert_eq!(
            serde_json::from_str::<Encoding>(r#""bzip2""#).unwrap(),
            Encoding::Bzip2
        );
    }

    #[test]
    fn url_queries_do_not_hide_the_suffix() {
        let source = InputSource::Url("https://host/day.gz?sig=abc".into());
        assert_eq!(source.name(), Some("https://host/day.gz"));
    }

    #[tokio::test]
    async fn objects_open_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert("logs", "a.gz", Bytes::from_static(b"zz"));
        let fetcher = Fetcher::new().with_store(store);

        let source: InputSource = "s3://logs/a.gz".parse().unwrap();
        let (mut reader, encoding) = fetcher.open(&source, None).await.unwrap();
        assert_eq!(encoding, Encoding::Gzip);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"zz");

        // an explicit hint wins over the suffix
        let (_, encoding) = fetcher.open(&source, Some(Encoding::Identity)).await.unwrap();
        assert_eq!(encoding, Encoding::Identity);
    }

    #[tokio::test]
    async fn s3_sources_need_a_store() {
        let source: InputSource = "s3://logs/a".parse().unwrap();
        let result = Fetcher::new().open(&source, None).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
