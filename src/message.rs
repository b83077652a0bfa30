//! Framed record channel and request-header codec
//!
//! Two record kinds travel over the spawn-server channel:
//!
//! - *Array records*: a 16-bit big-endian length prefix followed by that many
//!   bytes of NUL-terminated UTF-8 strings. Elements may not contain NUL.
//! - *Scalar records*: a 32-bit big-endian length prefix followed by that
//!   many raw bytes.
//!
//! The request-header blob sent to a worker is the body of one scalar record:
//! `(key \0 value \0)*` closed with the sentinel pair `"_\0_\0"`. The
//! in-worker deserializer splits on NUL and expects an even field count; a
//! trailing empty value would otherwise lose its field during the split, so
//! the sentinel is mandatory.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sentinel pair closing every request-header blob.
pub const HEADER_SENTINEL: &[u8] = b"_\0_\0";

/// Write an array record.
///
/// Fails with `InvalidInput` if any element contains a NUL byte or the
/// payload exceeds the 16-bit length prefix.
pub async fn write_array<W>(writer: &mut W, fields: &[&str]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = Vec::with_capacity(64);
    for field in fields {
        if field.as_bytes().contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "array record element contains NUL",
            ));
        }
        payload.extend_from_slice(field.as_bytes());
        payload.push(0);
    }
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "array record exceeds 64 KiB")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read an array record. Returns `None` on clean EOF at a record boundary.
pub async fn read_array<R>(reader: &mut R) -> io::Result<Option<Vec<String>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let mut fields = Vec::new();
    let mut rest: &[u8] = &payload;
    while let Some(pos) = rest.iter().position(|b| *b == 0) {
        let field = String::from_utf8(rest[..pos].to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "array record element is not UTF-8")
        })?;
        fields.push(field);
        rest = &rest[pos + 1..];
    }
    Ok(Some(fields))
}

/// Write a scalar record.
pub async fn write_scalar<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "scalar record exceeds 4 GiB")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read a scalar record. Returns `None` on clean EOF at a record boundary.
pub async fn read_scalar<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize request headers into the blob a worker deserializes.
///
/// Values may be empty; the trailing sentinel keeps the split-on-NUL field
/// count even regardless.
pub fn serialize_headers<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut blob = Vec::with_capacity(4 * 1024);
    for (name, value) in pairs {
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
        blob.extend_from_slice(value.as_bytes());
        blob.push(0);
    }
    blob.extend_from_slice(HEADER_SENTINEL);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirror of the in-worker deserializer: split on NUL, dropping trailing
    /// empty fields the way Ruby's `String#split` does.
    fn reference_split(blob: &[u8]) -> Vec<String> {
        let mut fields: Vec<String> = blob
            .split(|b| *b == 0)
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .collect();
        while fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        fields
    }

    #[tokio::test]
    async fn array_record_round_trip() {
        let mut buf = Vec::new();
        write_array(&mut buf, &["spawn_application", "/srv/apps/store", ""])
            .await
            .unwrap();

        // 16-bit big-endian prefix covers the NUL-terminated payload.
        let payload = b"spawn_application\0/srv/apps/store\0\0";
        assert_eq!(&buf[..2], (payload.len() as u16).to_be_bytes());
        assert_eq!(&buf[2..], payload);

        let fields = read_array(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(fields, vec!["spawn_application", "/srv/apps/store", ""]);
    }

    #[tokio::test]
    async fn array_record_rejects_nul_in_element() {
        let mut buf = Vec::new();
        let err = write_array(&mut buf, &["ok", "bad\0field"]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn read_array_clean_eof_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_array(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_array_truncated_record_is_error() {
        // Prefix promises 10 bytes, only 3 follow.
        let mut data: &[u8] = &[0, 10, b'a', b'b', b'c'];
        let err = read_array(&mut data).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn scalar_record_round_trip() {
        let mut buf = Vec::new();
        let body = b"<html>spawn failed</html>";
        write_scalar(&mut buf, body).await.unwrap();
        assert_eq!(&buf[..4], (body.len() as u32).to_be_bytes());

        let read = read_scalar(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(read, body);
    }

    #[tokio::test]
    async fn scalar_record_empty_body() {
        let mut buf = Vec::new();
        write_scalar(&mut buf, b"").await.unwrap();
        let read = read_scalar(&mut buf.as_slice()).await.unwrap().unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn headers_round_trip_with_empty_values() {
        // Header sets whose last value is empty are the reason the sentinel
        // exists: without it the reference splitter yields an odd count.
        let cases: Vec<Vec<(&str, &str)>> = vec![
            vec![],
            vec![("REQUEST_METHOD", "GET")],
            vec![("QUERY_STRING", ""), ("REQUEST_URI", "/")],
            vec![("HTTP_HOST", "www.test.com"), ("SSL_CLIENT_CERT", "")],
            vec![("A", ""), ("B", ""), ("C", "")],
        ];

        for pairs in cases {
            let blob = serialize_headers(pairs.iter().copied());
            let fields = reference_split(&blob);
            assert_eq!(fields.len() % 2, 0, "field count must be even: {fields:?}");

            let parsed: Vec<(String, String)> = fields
                .chunks(2)
                .map(|c| (c[0].clone(), c[1].clone()))
                .collect();
            let mut expected: Vec<(String, String)> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            expected.push(("_".to_string(), "_".to_string()));
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn sentinel_is_a_parseable_pair() {
        let blob = serialize_headers(std::iter::empty());
        assert_eq!(blob, HEADER_SENTINEL);
        assert_eq!(reference_split(&blob), vec!["_", "_"]);
    }
}
