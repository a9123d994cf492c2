use std::io::{self, Read, Write};

/// Bytes one direction of a relay could not hand to the kernel yet.
///
/// Every write is a single non-blocking attempt. Whatever the socket refuses
/// stays here, in order, until the next writable event.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    buf: Vec<u8>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Queues bytes without touching the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Sends `data` behind anything already queued and keeps the unsent
    /// remainder. Returns how many of the offered bytes the socket took.
    pub fn send<W: Write>(&mut self, writer: &mut W, data: &[u8]) -> io::Result<usize> {
        if !self.buf.is_empty() {
            self.buf.extend_from_slice(data);
            return self.flush(writer);
        }
        let n = write_once(writer, data)?;
        if n < data.len() {
            self.buf.extend_from_slice(&data[n..]);
        }
        Ok(n)
    }

    /// Retries the queued bytes once. Returns how many left the buffer.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        let n = write_once(writer, &self.buf)?;
        self.buf.drain(..n);
        Ok(n)
    }
}

/// One `write` call. Would-block means the socket took nothing.
pub fn write_once<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<usize> {
    loop {
        match writer.write(data) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(err),
        }
    }
}

/// One `read` call. `None` means nothing is available right now; `Some(0)` is
/// end of stream.
pub fn read_once<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Accepts at most `limit` bytes per call, then would-block.
    struct ShortWriter {
        limit: usize,
        written: Vec<u8>,
        blocked: bool,
    }

    impl ShortWriter {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                written: Vec::new(),
                blocked: false,
            }
        }
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn full_write_leaves_nothing_pending() {
        let mut pending = PendingBuffer::new();
        let mut writer = ShortWriter::new(usize::MAX);
        assert_eq!(pending.send(&mut writer, b"hello").unwrap(), 5);
        assert!(pending.is_empty());
        assert_eq!(writer.written, b"hello");
    }

    #[test]
    fn would_block_keeps_everything() {
        let mut pending = PendingBuffer::new();
        let mut writer = ShortWriter::new(usize::MAX);
        writer.blocked = true;
        assert_eq!(pending.send(&mut writer, b"hello").unwrap(), 0);
        assert_eq!(pending.as_slice(), b"hello");
    }

    #[test]
    fn new_data_queues_behind_the_remainder() {
        let mut pending = PendingBuffer::new();
        let mut writer = ShortWriter::new(3);
        pending.send(&mut writer, b"abcdef").unwrap();
        assert_eq!(pending.as_slice(), b"def");

        writer.limit = 2;
        pending.send(&mut writer, b"gh").unwrap();
        assert_eq!(writer.written, b"abcde");
        assert_eq!(pending.as_slice(), b"fgh");

        writer.limit = usize::MAX;
        assert_eq!(pending.flush(&mut writer).unwrap(), 3);
        assert!(pending.is_empty());
        assert_eq!(writer.written, b"abcdefgh");
    }

    #[test]
    fn hard_errors_propagate() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut pending = PendingBuffer::new();
        let err = pending.send(&mut Broken, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn read_once_maps_would_block_and_eof() {
        struct Scripted(Vec<io::Result<usize>>);
        impl Read for Scripted {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                self.0.remove(0)
            }
        }
        let mut reader = Scripted(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(4),
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(0),
        ]);
        let mut buf = [0_u8; 8];
        assert_eq!(read_once(&mut reader, &mut buf).unwrap(), Some(4));
        assert_eq!(read_once(&mut reader, &mut buf).unwrap(), None);
        assert_eq!(read_once(&mut reader, &mut buf).unwrap(), Some(0));
    }

    proptest! {
        #[test]
        fn short_write_keeps_exactly_the_unsent_suffix(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            accepted in 0_usize..4096,
        ) {
            let mut pending = PendingBuffer::new();
            let mut writer = ShortWriter::new(accepted);
            let n = pending.send(&mut writer, &data).unwrap();

            prop_assert_eq!(n, accepted.min(data.len()));
            prop_assert_eq!(pending.as_slice(), &data[n..]);
            prop_assert_eq!(&writer.written[..], &data[..n]);
        }
    }
}
