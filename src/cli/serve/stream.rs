//! Long-lived watch streams.
//!
//! `POST /_events/watch` takes over the raw connection and writes a chunked
//! `application/x-ndjson` body by hand:
//!
//! ```text
//! {"sid":"...","failed":[2]}
//! {"wid":0,"data":"1729012345678901234"}
//!                                          ← keep-alive
//! {"wid":1,"data":{"votes":3,"answers":{"a":2,"b":1}}}
//! ```
//!
//! The stream ends on the first write error (client gone) or on shutdown.
//! The session is closed on every exit path.

use std::{
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use crossbeam::channel::RecvTimeoutError;
use tiny_http::Request;

use super::{read_json, request_context, response};
use crate::{
    core::is_shutdown,
    debug,
    events::{
        EventHub, Watcher,
        protocol::{Opened, WatchRequest, frame, line},
    },
    utils::mime::types,
};

/// Records written per chunk at most.
const BATCH: usize = 64;

/// `Transfer-Encoding: chunked` body over a raw connection.
pub struct ChunkedWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    /// Write the response head.
    pub fn start(mut inner: W, content_type: &str) -> io::Result<Self> {
        write!(
            inner,
            "HTTP/1.1 200 OK\r\n\
             Content-Type: {content_type}\r\n\
             Transfer-Encoding: chunked\r\n\
             Cache-Control: no-cache\r\n\
             X-Accel-Buffering: no\r\n\
             Connection: close\r\n\r\n"
        )?;
        inner.flush()?;
        Ok(Self { inner })
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write!(self.inner, "{:X}\r\n", data.len())?;
        self.inner.write_all(data)?;
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()
    }

    /// Terminating zero-length chunk.
    pub fn finish(mut self) -> io::Result<()> {
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.flush()
    }
}

/// Closes the session when the stream ends, however it ends.
struct Session<'a> {
    hub: &'a EventHub,
    watcher: Arc<Watcher>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.hub.close(&self.watcher);
    }
}

/// Serve `POST /_events/watch` until the client disconnects.
pub fn serve_watch(mut request: Request, hub: &EventHub, keepalive: Duration) -> Result<()> {
    let ctx = request_context(&request);
    let body: WatchRequest = match read_json(&mut request) {
        Ok(body) => body,
        Err(e) => return response::respond_error(request, 400, &e.to_string()),
    };

    let session = Session {
        hub,
        watcher: hub.register_watcher(),
    };
    let watcher = &session.watcher;
    let failed = hub.watch(watcher, &body.add, &ctx)?;

    let mut writer = ChunkedWriter::start(request.into_writer(), types::NDJSON)?;
    let opened = line(&Opened {
        sid: watcher.sid(),
        failed,
    })?;
    writer.write_chunk(opened.as_bytes())?;

    match pump(watcher, &mut writer, hub, keepalive) {
        Ok(()) => writer.finish()?,
        Err(e) => debug!("events"; "session {} stream ended: {}", watcher.sid(), e),
    }
    Ok(())
}

/// Forward mailbox records to `writer`, with a keep-alive line after each
/// idle `keepalive`. Returns on shutdown, or with the first write error.
pub fn pump<W: Write>(
    watcher: &Watcher,
    writer: &mut ChunkedWriter<W>,
    hub: &EventHub,
    keepalive: Duration,
) -> io::Result<()> {
    while !is_shutdown() {
        match watcher.recv_timeout(keepalive) {
            Ok(record) => {
                let mut chunk = frame(&record);
                for record in std::iter::from_fn(|| watcher.try_recv()).take(BATCH - 1) {
                    chunk.push_str(&frame(&record));
                }
                writer.write_chunk(chunk.as_bytes())?;
            }
            Err(RecvTimeoutError::Timeout) => {
                writer.write_chunk(b"\n")?;
                hub.touch();
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
    Ok(())
}
