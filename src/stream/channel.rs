//! Hand-off of a reassembled byte stream from the capture loop to its worker.

use super::StreamEnd;
use bytes::Bytes;
use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Debug)]
enum StreamEvent {
    Data(Bytes),
    End(StreamEnd),
}

/// Write half, owned by the flow. Writes never block.
#[derive(Debug)]
pub(crate) struct StreamWriter {
    tx: Option<Sender<StreamEvent>>,
}

/// Read half, owned by the worker
#[derive(Debug)]
pub(crate) struct StreamReader {
    rx: Receiver<StreamEvent>,
    end: Option<StreamEnd>,
}

pub(crate) fn stream() -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::channel();
    (StreamWriter { tx: Some(tx) }, StreamReader { rx, end: None })
}

impl StreamWriter {
    /// Queue bytes for the reader. Once the reader has gone away the bytes are
    /// dropped and later writes are no-ops.
    pub(crate) fn write(&mut self, bytes: Bytes) {
        if let Some(tx) = &self.tx
            && tx.send(StreamEvent::Data(bytes)).is_err()
        {
            self.tx = None;
        }
    }

    /// Signal end-of-stream. Idempotent.
    pub(crate) fn close(&mut self, end: StreamEnd) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(StreamEvent::End(end));
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl StreamReader {
    /// Block until more bytes arrive. `None` means end-of-stream.
    pub(crate) fn next_chunk(&mut self) -> Option<Bytes> {
        if self.end.is_some() {
            return None;
        }
        match self.rx.recv() {
            Ok(StreamEvent::Data(bytes)) => Some(bytes),
            Ok(StreamEvent::End(end)) => {
                self.end = Some(end);
                None
            }
            // writer dropped without closing
            Err(_) => {
                self.end = Some(StreamEnd::Lossy);
                None
            }
        }
    }

    /// How the stream ended, once `next_chunk` has returned `None`
    pub(crate) fn end(&self) -> Option<StreamEnd> {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_then_end() {
        let (mut writer, mut reader) = stream();
        writer.write(Bytes::from_static(b"GET "));
        writer.write(Bytes::from_static(b"/"));
        writer.close(StreamEnd::Complete);
        writer.close(StreamEnd::Lossy);

        assert_eq!(reader.next_chunk().as_deref(), Some(&b"GET "[..]));
        assert_eq!(reader.next_chunk().as_deref(), Some(&b"/"[..]));
        assert_eq!(reader.next_chunk(), None);
        assert_eq!(reader.next_chunk(), None);
        assert_eq!(reader.end(), Some(StreamEnd::Complete));
    }

    #[test]
    fn test_dropped_writer_ends_stream() {
        let (writer, mut reader) = stream();
        let handle = thread::spawn(move || reader_drain(&mut reader));
        drop(writer);
        assert_eq!(handle.join().unwrap(), Some(StreamEnd::Lossy));
    }

    fn reader_drain(reader: &mut StreamReader) -> Option<StreamEnd> {
        while reader.next_chunk().is_some() {}
        reader.end()
    }

    #[test]
    fn test_writer_notices_gone_reader() {
        let (mut writer, reader) = stream();
        drop(reader);
        writer.write(Bytes::from_static(b"lost"));
        assert!(writer.is_closed());
    }
}
