use std::{
    convert::Infallible,
    future::Future,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{stream, task::noop_waker_ref};
use multer::Multipart;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("not a multipart upload: {0}")]
    ContentType(String),
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("upload carries no file part")]
    NoFilePart,
    #[error("multipart reader stopped making progress")]
    Stalled,
}

impl From<multer::Error> for UploadError {
    fn from(err: multer::Error) -> Self {
        Self::Multipart(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Start {
        filename: Option<String>,
        size: Option<u32>,
    },
    Data(Vec<u8>),
}

/// Extracts the boundary from a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, UploadError> {
    multer::parse_boundary(content_type).map_err(|err| UploadError::ContentType(err.to_string()))
}

/// Bytes handed from the blocking reader to the multipart stream.
#[derive(Debug, Default)]
struct Feed {
    chunk: Option<Bytes>,
    eof: bool,
}

fn lock(feed: &Mutex<Feed>) -> MutexGuard<'_, Feed> {
    feed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Streams the first file part of a multipart body through `on_event`
/// without buffering the upload. `read` pulls up to `chunk_size` body bytes
/// at a time and returns 0 at the end of the body.
pub fn stream_first_part<E, R, F>(
    content_type: &str,
    chunk_size: usize,
    mut read: R,
    mut on_event: F,
) -> Result<(), E>
where
    E: From<UploadError>,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    F: FnMut(UploadEvent) -> Result<(), E>,
{
    let boundary = boundary_from_content_type(content_type)?;
    let feed = Arc::new(Mutex::new(Feed::default()));
    let source = feed.clone();
    let body = stream::poll_fn(move |_| {
        let mut feed = lock(&source);
        match feed.chunk.take() {
            Some(chunk) => Poll::Ready(Some(Ok::<_, Infallible>(chunk))),
            None if feed.eof => Poll::Ready(None),
            None => Poll::Pending,
        }
    });

    let mut upload = pin!(first_file_part(Multipart::new(body, boundary), &mut on_event));
    let mut cx = Context::from_waker(noop_waker_ref());
    let mut buf = vec![0_u8; chunk_size.max(1)];
    loop {
        if let Poll::Ready(result) = upload.as_mut().poll(&mut cx) {
            return result;
        }
        {
            let feed = lock(&feed);
            if feed.eof || feed.chunk.is_some() {
                return Err(UploadError::Stalled.into());
            }
        }
        let read = read(&mut buf)?;
        let mut feed = lock(&feed);
        if read == 0 {
            feed.eof = true;
        } else {
            feed.chunk = Some(Bytes::copy_from_slice(&buf[..read]));
        }
    }
}

async fn first_file_part<E, F>(mut multipart: Multipart<'static>, on_event: &mut F) -> Result<(), E>
where
    E: From<UploadError>,
    F: FnMut(UploadEvent) -> Result<(), E>,
{
    while let Some(mut field) = multipart.next_field().await.map_err(UploadError::from)? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let size = field
            .headers()
            .get("content-length")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u32>().ok());
        on_event(UploadEvent::Start {
            filename: Some(filename),
            size,
        })?;
        while let Some(chunk) = field.chunk().await.map_err(UploadError::from)? {
            on_event(UploadEvent::Data(chunk.to_vec()))?;
        }
        return Ok(());
    }
    Err(UploadError::NoFilePart.into())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use pretty_assertions::assert_eq;

    const CONTENT_TYPE: &str = "multipart/form-data; boundary=----labexpert42";

    fn body(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (headers, data) in parts {
            body.extend_from_slice(b"------labexpert42\r\n");
            body.extend_from_slice(headers.as_bytes());
            body.extend_from_slice(b"\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"------labexpert42--\r\n");
        body
    }

    fn firmware() -> Vec<u8> {
        let mut image: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
        image[0] = 0xE9;
        // a near miss of the delimiter inside the payload
        image[100..113].copy_from_slice(b"\r\n------label");
        image
    }

    fn run(
        raw: &[u8],
        chunk_size: usize,
    ) -> (Result<(), UploadError>, Vec<UploadEvent>) {
        let mut reader = raw;
        let mut events = Vec::new();
        let result = stream_first_part(
            CONTENT_TYPE,
            chunk_size,
            |buf: &mut [u8]| Ok(reader.read(buf).unwrap_or(0)),
            |event| {
                events.push(event);
                Ok(())
            },
        );
        (result, events)
    }

    fn data(events: &[UploadEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                UploadEvent::Data(chunk) => Some(chunk.as_slice()),
                UploadEvent::Start { .. } => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    #[test]
    fn boundary_comes_from_the_content_type() {
        assert_eq!(
            boundary_from_content_type(CONTENT_TYPE).unwrap(),
            "----labexpert42"
        );
        assert!(matches!(
            boundary_from_content_type("application/octet-stream"),
            Err(UploadError::ContentType(_))
        ));
    }

    #[test]
    fn file_part_survives_any_read_size() {
        let image = firmware();
        let raw = body(&[(
            "Content-Disposition: form-data; name=\"update\"; filename=\"thr.bin\"\r\nContent-Type: application/octet-stream",
            &image[..],
        )]);

        for chunk_size in [1, 13, 512, 4096, 64 * 1024] {
            let (result, events) = run(&raw, chunk_size);
            assert_eq!(result, Ok(()), "read size {chunk_size}");
            assert_eq!(
                events[0],
                UploadEvent::Start {
                    filename: Some("thr.bin".to_string()),
                    size: None,
                }
            );
            assert_eq!(data(&events), image, "read size {chunk_size}");
        }
    }

    #[test]
    fn plain_fields_are_skipped_and_part_length_is_reported() {
        let raw = body(&[
            ("Content-Disposition: form-data; name=\"note\"", &b"nightly"[..]),
            (
                "Content-Disposition: form-data; name=\"update\"; filename=\"fw.bin\"\r\nContent-Length: 4",
                &[0xE9_u8, 1, 2, 3][..],
            ),
        ]);

        let (result, events) = run(&raw, 64);

        assert_eq!(result, Ok(()));
        assert_eq!(
            events,
            vec![
                UploadEvent::Start {
                    filename: Some("fw.bin".to_string()),
                    size: Some(4),
                },
                UploadEvent::Data(vec![0xE9, 1, 2, 3]),
            ]
        );
    }

    #[test]
    fn body_without_file_part_is_rejected() {
        let raw = body(&[("Content-Disposition: form-data; name=\"note\"", &b"hi"[..])]);
        assert_eq!(run(&raw, 64).0, Err(UploadError::NoFilePart));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let image = firmware();
        let raw = body(&[(
            "Content-Disposition: form-data; name=\"update\"; filename=\"thr.bin\"",
            &image[..],
        )]);

        let (result, events) = run(&raw[..raw.len() / 2], 256);

        assert!(matches!(result, Err(UploadError::Multipart(_))));
        assert!(data(&events).len() < image.len());
    }

    #[test]
    fn failing_consumer_stops_the_upload() {
        let raw = body(&[(
            "Content-Disposition: form-data; name=\"update\"; filename=\"thr.bin\"",
            &firmware()[..],
        )]);
        let mut reader = raw.as_slice();
        let mut reads = 0;
        let mut chunks = 0;

        let result = stream_first_part::<UploadError, _, _>(
            CONTENT_TYPE,
            64,
            |buf: &mut [u8]| {
                reads += 1;
                Ok(reader.read(buf).unwrap_or(0))
            },
            |event| match event {
                UploadEvent::Data(_) if chunks == 2 => Err(UploadError::Stalled),
                UploadEvent::Data(_) => {
                    chunks += 1;
                    Ok(())
                }
                UploadEvent::Start { .. } => Ok(()),
            },
        );

        assert_eq!(result, Err(UploadError::Stalled));
        assert!(reads < raw.len() / 64);
    }
}
