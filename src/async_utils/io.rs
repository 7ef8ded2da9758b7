//! Reading input records and config files, and writing JSONL.
//!
//! Input records may be JSONL or CSV, from a file or stdin. Files are
//! recognized by extension; stdin by peeking at the first byte. Config files
//! (prompts, manifests) may be JSON or TOML.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{TryStreamExt, pin_mut, stream::StreamExt as _};
use peekable::tokio::AsyncPeekable;
use serde_json::Map;
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt as _, AsyncWrite,
        AsyncWriteExt as _, BufReader, BufWriter, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use crate::{
    prelude::*,
    ui::Ui,
};

use super::BoxedStream;

/// A JSON object, without the [`Value::Object`] wrapper.
pub type JsonObject = Map<String, Value>;

/// A stream of JSON values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// A buffered reader that knows whether its input looks like JSON.
pub struct SmartReader {
    is_json_like: bool,

    /// Where the data comes from, for error messages.
    description: String,

    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Wrap a reader, peeking at its first byte to see if it's JSON.
    pub async fn new_from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut peekable = AsyncPeekable::new(Box::new(BufReader::new(reader)));
        let mut first = [0u8; 1];
        let is_json_like = match peekable.peek_exact(&mut first).await {
            Ok(_) => first[0] == b'{',
            // Empty input. Treat it as empty JSONL.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => true,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read from {description}"));
            }
        };
        Ok(Self {
            is_json_like,
            description,
            reader: Box::pin(BufReader::new(peekable)),
        })
    }

    /// Open a file. `.json`, `.jsonl` and `.ndjson` are JSON-like.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let is_json_like = ext == "json" || ext == "jsonl" || ext == "ndjson";
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {:?}", path.display()))?;
        Ok(Self {
            is_json_like,
            description: path.display().to_string(),
            reader: Box::pin(BufReader::new(file)),
        })
    }

    pub async fn new_from_path_or_stdin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::new_from_path(path).await,
            None => Self::new_from_reader("stdin".to_owned(), tokio::io::stdin()).await,
        }
    }

    pub fn is_json_like(&self) -> bool {
        self.is_json_like
    }
}

impl AsyncRead for SmartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for SmartReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Read a whole file, or all of stdin, as text.
pub async fn read_text(path: Option<&Path>) -> Result<String> {
    let mut reader: Box<dyn AsyncRead + Unpin + Send> = match path {
        Some(path) => Box::new(
            File::open(path)
                .await
                .with_context(|| format!("Failed to open {:?}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .await
        .context("Failed to read text input")?;
    Ok(text)
}

/// Read a JSON or TOML file.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut reader = SmartReader::new_from_path(path).await?;
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .await
        .with_context(|| format!("Failed to read {:?}", path.display()))?;
    if reader.is_json_like() {
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON in {:?}", path.display()))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("Failed to parse TOML in {:?}", path.display()))
    }
}

/// Count the records in a JSONL or CSV file, so we can show a real progress
/// bar. Returns `None` for things we can't read twice, like named pipes.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_jsonl_or_csv_records(ui: &Ui, path: &Path) -> Result<Option<usize>> {
    if !path.is_file() {
        return Ok(None);
    }

    let spinner = ui.counting_spinner();
    let reader = SmartReader::new_from_path(path).await?;
    let count = if reader.is_json_like() {
        LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .try_fold(0, |acc, _line| async move { Ok(acc + 1) })
            .await?
    } else {
        csv_async::AsyncReaderBuilder::new()
            .create_reader(reader)
            .into_byte_records()
            .try_fold(0, |acc, _record| async move { Ok(acc + 1) })
            .await?
    };
    spinner.finish_with_message(format!("Found {count} records"));
    Ok(Some(count))
}

/// Read JSONL or CSV records from a file or stdin. CSV rows become objects
/// keyed by header, with string values. Blank JSONL lines are skipped.
pub async fn read_jsonl_or_csv(path: Option<&Path>) -> Result<JsonStream> {
    let reader = SmartReader::new_from_path_or_stdin(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_json_like() {
        let lines = LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()));
        Ok(lines
            .map(move |line| {
                let line = line?;
                serde_json::from_str::<Value>(&line).with_context(|| {
                    format!("Failed to parse JSON line in {}: {:?}", description, line)
                })
            })
            .boxed())
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("Failed to read CSV headers from {description}"))?
                .to_owned(),
        );
        Ok(reader
            .into_records()
            .map(move |record| {
                let record = record.with_context(|| {
                    format!("Failed to read CSV record from {description}")
                })?;
                let obj = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(header, value)| {
                        (header.to_owned(), Value::String(value.to_owned()))
                    })
                    .collect::<JsonObject>();
                Ok(Value::Object(obj))
            })
            .boxed())
    }
}

/// Open a file for writing, or use stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create {:?}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write JSON values as JSONL to a file or stdout.
pub async fn write_output(path: Option<&Path>, stream: JsonStream) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let mut line = serde_json::to_vec(&value?).context("Failed to serialize output")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("Failed to write output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
