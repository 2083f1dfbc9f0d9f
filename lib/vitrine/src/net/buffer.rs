use std::cmp;
use std::io;

// Buffer capacities are multiples of this to keep reads off the socket large.
const BUF_SIZE_INCREMENT: usize = 65536;

/// A bounded, contiguous FIFO byte queue. Data is appended at the tail and
/// consumed from the head; the backing storage compacts itself once the dead
/// prefix grows past half the capacity, so `read_slice` is always a single
/// contiguous view.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        if limit % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, limit
            );
        }

        Buffer {
            data: Vec::with_capacity(cmp::min(limit, BUF_SIZE_INCREMENT)),
            head: 0,
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.len()
    }

    /// Slice containing all buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "Consumed past the buffered data");

        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > self.limit / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append raw bytes at the tail. The caller is expected to have checked
    /// `free_capacity` first.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.free_capacity(), "Buffer overrun");
        self.data.extend_from_slice(bytes);
    }

    /// Read all currently available data from the supplied reader into the
    /// buffer. Returns the number of bytes transferred; a would-block or
    /// timeout simply ends the drain. A zero-length read is a closed peer and
    /// surfaces as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 8192];

        while self.len() < self.limit {
            let want = cmp::min(chunk.len(), self.limit - self.len());

            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Perform a single read call against the supplied reader. Blocking
    /// readers use this so one slow socket read cannot stall behind a full
    /// drain loop. Would-block and timeout errors propagate to the caller.
    pub fn ingress_some<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; 8192];
        let want = cmp::min(chunk.len(), self.limit - self.len());

        if want == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
        }

        match reader.read(&mut chunk[..want])? {
            0 => Err(io::ErrorKind::UnexpectedEof.into()),
            count => {
                self.data.extend_from_slice(&chunk[..count]);
                Ok(count)
            }
        }
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head past everything written. Would-block errors propagate with the
    /// unwritten remainder left in place.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let orig_len = self.len();

        while !self.is_empty() {
            let count = writer.write(self.read_slice())?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.consume(count);
        }

        Ok(orig_len)
    }
}
