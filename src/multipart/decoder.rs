use super::{MultipartError, boundary};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, future::poll_fn};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

/// Upper bound for one part's header block.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Upper bound for a non-file field value, which is materialized in memory.
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

const INITIAL_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the first `--boundary`.
    Preamble,
    /// Just past a boundary; expecting `\r\n` or the closing `--`.
    AfterBoundary,
    Headers,
    Body,
    Done,
}

#[derive(Debug)]
struct PartHeaders {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
}

/// Pull-based, single-pass decoder over a `multipart/form-data` body.
pub struct MultipartDecoder<S> {
    stream: S,
    buffer: BytesMut,
    /// `--boundary`, the form of the first delimiter.
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`, which terminates every part body.
    delimiter: Vec<u8>,
    state: State,
    eof: bool,
    seen_bytes: bool,
}

/// One decoded field. File parts carry a stream borrowed from the decoder.
pub struct MultipartField<'a, S> {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: FieldBody<'a, S>,
}

pub enum FieldBody<'a, S> {
    Value(String),
    Stream(FieldStream<'a, S>),
}

/// Body bytes of a file part. Ends at the part's closing delimiter.
pub struct FieldStream<'a, S> {
    decoder: &'a mut MultipartDecoder<S>,
}

impl<S> MultipartDecoder<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Validate the request content type and build a decoder for its boundary.
    /// Nothing is read from `stream` until the first [`next_field`](Self::next_field).
    pub fn from_content_type(
        content_type: Option<&str>,
        stream: S,
    ) -> Result<Self, MultipartError> {
        let boundary = parse_boundary(content_type.ok_or(MultipartError::NotMultipart)?)?;
        Ok(Self::new(&boundary, stream))
    }

    pub fn new(boundary: &str, stream: S) -> Self {
        let dash_boundary = [b"--".as_slice(), boundary.as_bytes()].concat();
        let delimiter = [b"\r\n".as_slice(), &dash_boundary].concat();
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            dash_boundary,
            delimiter,
            state: State::Preamble,
            eof: false,
            seen_bytes: false,
        }
    }

    /// Advance to the next field, skipping any unread bytes of the previous one.
    ///
    /// Returns `Ok(None)` once the closing boundary has been seen.
    pub async fn next_field(&mut self) -> Result<Option<MultipartField<'_, S>>, MultipartError> {
        let Some(headers) = poll_fn(|cx| self.poll_next_part(cx)).await? else {
            return Ok(None);
        };

        if headers.file_name.is_none() {
            let value = self.read_value(&headers.name).await?;
            return Ok(Some(MultipartField {
                name: headers.name,
                file_name: None,
                content_type: headers.content_type,
                body: FieldBody::Value(value),
            }));
        }

        Ok(Some(MultipartField {
            name: headers.name,
            file_name: headers.file_name,
            content_type: headers.content_type,
            body: FieldBody::Stream(FieldStream { decoder: self }),
        }))
    }

    async fn read_value(&mut self, name: &str) -> Result<String, MultipartError> {
        let mut value = Vec::new();
        while let Some(chunk) = poll_fn(|cx| self.poll_body_chunk(cx)).await {
            let chunk = chunk?;
            if value.len() + chunk.len() > MAX_VALUE_BYTES {
                self.state = State::Done;
                return Err(MultipartError::ValueTooLarge(name.to_string()));
            }
            value.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), MultipartError>> {
        if self.eof {
            return Poll::Ready(Ok(()));
        }
        match ready!(Pin::new(&mut self.stream).poll_next(cx)) {
            Some(Ok(bytes)) => {
                if !bytes.is_empty() {
                    self.seen_bytes = true;
                    self.buffer.extend_from_slice(&bytes);
                }
            }
            Some(Err(err)) => return Poll::Ready(Err(MultipartError::Io(err))),
            None => self.eof = true,
        }
        Poll::Ready(Ok(()))
    }

    fn fail<T>(&mut self, err: MultipartError) -> Poll<Result<T, MultipartError>> {
        self.state = State::Done;
        Poll::Ready(Err(err))
    }

    fn poll_next_part(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<PartHeaders>, MultipartError>> {
        loop {
            match self.state {
                State::Done => return Poll::Ready(Ok(None)),
                State::Body => {
                    // unread remainder of the previous field
                    if let Some(Err(err)) = ready!(self.poll_body_chunk(cx)) {
                        return Poll::Ready(Err(err));
                    }
                    continue;
                }
                State::Preamble => {
                    if let Some(idx) = boundary::find(&self.buffer, &self.dash_boundary) {
                        self.buffer.advance(idx + self.dash_boundary.len());
                        self.state = State::AfterBoundary;
                        continue;
                    }
                    let keep = boundary::partial_suffix_len(&self.buffer, &self.dash_boundary);
                    let discard = self.buffer.len() - keep;
                    self.buffer.advance(discard);
                    if self.eof {
                        if self.seen_bytes {
                            return self.fail(MultipartError::Malformed("no boundary in body"));
                        }
                        self.state = State::Done;
                        return Poll::Ready(Ok(None));
                    }
                }
                State::AfterBoundary => {
                    if self.buffer.len() >= 2 {
                        if self.buffer.starts_with(b"--") {
                            self.state = State::Done;
                            self.buffer.clear();
                            return Poll::Ready(Ok(None));
                        }
                        if self.buffer.starts_with(b"\r\n") {
                            self.buffer.advance(2);
                            self.state = State::Headers;
                            continue;
                        }
                        return self.fail(MultipartError::Malformed(
                            "unexpected bytes after boundary",
                        ));
                    }
                    if self.eof {
                        return self.fail(MultipartError::UnexpectedEof);
                    }
                }
                State::Headers => {
                    let header_end = if self.buffer.starts_with(b"\r\n") {
                        Some((0, 2))
                    } else {
                        boundary::find(&self.buffer, b"\r\n\r\n").map(|idx| (idx, idx + 4))
                    };
                    if let Some((end, consumed)) = header_end {
                        if end > MAX_HEADER_BYTES {
                            return self.fail(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES));
                        }
                        let parsed = parse_part_headers(&self.buffer[..end]);
                        self.buffer.advance(consumed);
                        return match parsed {
                            Ok(headers) => {
                                self.state = State::Body;
                                Poll::Ready(Ok(Some(headers)))
                            }
                            Err(err) => self.fail(err),
                        };
                    }
                    if self.buffer.len() > MAX_HEADER_BYTES + 4 {
                        return self.fail(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES));
                    }
                    if self.eof {
                        return self.fail(MultipartError::UnexpectedEof);
                    }
                }
            }

            if let Err(err) = ready!(self.poll_fill(cx)) {
                return self.fail(err);
            }
        }
    }

    /// Yield the next slice of the current part body, or `None` at its delimiter.
    ///
    /// Bytes that might be the beginning of a split delimiter stay buffered
    /// until the next read settles them.
    fn poll_body_chunk(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, MultipartError>>> {
        loop {
            if self.state != State::Body {
                return Poll::Ready(None);
            }
            if let Some(idx) = boundary::find(&self.buffer, &self.delimiter) {
                if idx > 0 {
                    return Poll::Ready(Some(Ok(self.buffer.split_to(idx).freeze())));
                }
                self.buffer.advance(self.delimiter.len());
                self.state = State::AfterBoundary;
                return Poll::Ready(None);
            }
            let keep = boundary::partial_suffix_len(&self.buffer, &self.delimiter);
            let settled = self.buffer.len() - keep;
            if settled > 0 {
                return Poll::Ready(Some(Ok(self.buffer.split_to(settled).freeze())));
            }
            if self.eof {
                self.state = State::Done;
                return Poll::Ready(Some(Err(MultipartError::UnexpectedEof)));
            }
            if let Err(err) = ready!(self.poll_fill(cx)) {
                self.state = State::Done;
                return Poll::Ready(Some(Err(err)));
            }
        }
    }
}

impl<S> Stream for FieldStream<'_, S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes, MultipartError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.decoder.poll_body_chunk(cx)
    }
}

/// Extract the boundary token from a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    let mut params = split_params(content_type).into_iter();
    let mime = params.next().unwrap_or_default();
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return Err(MultipartError::NotMultipart);
    }
    for param in params {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("boundary") {
                let value = unquote(value);
                if value.is_empty() {
                    return Err(MultipartError::MissingBoundary);
                }
                return Ok(value);
            }
        }
    }
    Err(MultipartError::MissingBoundary)
}

fn parse_part_headers(block: &[u8]) -> Result<PartHeaders, MultipartError> {
    let text = String::from_utf8_lossy(block);
    let mut name = None;
    let mut file_name = None;
    let mut content_type = None;

    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in split_params(value).into_iter().skip(1) {
                let Some((k, v)) = param.split_once('=') else {
                    continue;
                };
                match k.trim().to_ascii_lowercase().as_str() {
                    "name" => name = Some(unquote(v)),
                    "filename" => file_name = Some(unquote(v)).filter(|f| !f.is_empty()),
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    Ok(PartHeaders {
        name: name.ok_or(MultipartError::MissingName)?,
        file_name,
        content_type,
    })
}

/// Split a header value on `;`, ignoring separators inside quoted strings.
fn split_params(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}
