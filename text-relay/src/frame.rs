use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a peer may send in a single frame, excluding the line ending.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reads the next newline-terminated payload of at most [`MAX_FRAME_LEN`] bytes.
///
/// Blank lines are skipped and a trailing `\r` is dropped. Returns `Ok(None)`
/// once the peer has closed its side of the stream. A final line without a
/// terminator is still returned as a frame.
///
/// Not cancel safe: a partially read line is lost if the future is dropped.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// [`read_frame`] with a caller-chosen payload limit.
pub async fn read_frame_limited<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // Payload plus a `\r\n` terminator.
    let read_limit = max_len as u64 + 2;
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(read_limit)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }

        if bytes as u64 == read_limit && line.last() != Some(&b'\n') {
            return Err(oversized_frame());
        }

        let text = std::str::from_utf8(&line).map_err(to_io_error)?;
        let trimmed = text.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > max_len {
            return Err(oversized_frame());
        }

        return Ok(Some(trimmed.to_string()));
    }
}

/// Encodes `payload` as one frame. Fails with `InvalidInput` if the payload
/// contains a newline, since that would split it into two frames.
///
/// Outgoing frames are not length-capped: membership updates grow with the
/// number of peers.
pub fn encode_frame(payload: &str) -> io::Result<Vec<u8>> {
    if payload.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload contains a newline",
        ));
    }

    let mut encoded = Vec::with_capacity(payload.len() + 1);
    encoded.extend_from_slice(payload.as_bytes());
    encoded.push(b'\n');
    Ok(encoded)
}

/// Writes `payload` as one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(payload)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn oversized_frame() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
}

fn to_io_error(err: std::str::Utf8Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn reassembles_fragmented_frame() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        let producer = tokio::spawn(async move {
            writer.write_all(b"ali").await.expect("first fragment");
            writer.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write_all(b"ce\n").await.expect("second fragment");
        });

        let frame = read_frame(&mut reader).await.expect("read frame");
        assert_eq!(frame.as_deref(), Some("alice"));
        producer.await.expect("producer task");
    }

    #[tokio::test]
    async fn splits_coalesced_frames() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"bob\nAll:hi: there\r\n\n\nC:yo")
            .await
            .expect("write");
        drop(writer);

        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("bob"));
        assert_eq!(
            read_frame(&mut reader).await.unwrap().as_deref(),
            Some("All:hi: there")
        );
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("C:yo"));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = BufReader::new(reader);

        let producer = tokio::spawn(async move {
            let junk = vec![b'x'; MAX_FRAME_LEN + 16];
            let _ = writer.write_all(&junk).await;
        });

        let err = read_frame(&mut reader).await.expect_err("oversized frame");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drop(reader);
        producer.await.expect("producer task");
    }

    #[tokio::test]
    async fn rejects_invalid_utf8() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = BufReader::new(reader);

        writer.write_all(&[0xff, 0xfe, b'\n']).await.expect("write");

        let err = read_frame(&mut reader).await.expect_err("invalid utf-8");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn write_refuses_embedded_newline() {
        let (mut writer, _reader) = tokio::io::duplex(64);

        let err = write_frame(&mut writer, "two\nframes")
            .await
            .expect_err("embedded newline");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn limit_is_chosen_by_reader() {
        let (mut writer, reader) = tokio::io::duplex(256 * 1024);
        let mut reader = BufReader::new(reader);
        let long = "x".repeat(MAX_FRAME_LEN + 100);

        write_frame(&mut writer, &long).await.expect("write long frame");
        let frame = read_frame_limited(&mut reader, 4 * MAX_FRAME_LEN)
            .await
            .expect("read long frame");

        assert_eq!(frame.map(|payload| payload.len()), Some(MAX_FRAME_LEN + 100));
    }

    #[tokio::test]
    async fn written_frame_reads_back() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        write_frame(&mut writer, "USERLIST:All,alice")
            .await
            .expect("write frame");
        let frame = read_frame(&mut reader).await.expect("read frame");

        assert_eq!(frame.as_deref(), Some("USERLIST:All,alice"));
    }
}
