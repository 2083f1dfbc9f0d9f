use std::io;
use std::net;

pub type WireResult<T> = Result<T, WireError>;

/// Two-level error model used on every non-blocking path. `Wait` means the
/// operation could not make progress and should be retried when the resource
/// is ready; `Fatal` carries a typed reason and ends the connection, call or
/// session it occurred on.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Null argument, missing field or other malformed request.
    ProtocolViolation,
    /// Event name not in the catalogue.
    UnknownEvent,
    /// A synchronous call ran past its deadline.
    Timeout,
    /// The underlying channel is gone.
    ConnectionClosed,
    /// Malformed document encoding.
    Codec,
    PayloadTooLarge,
    EmptyDocument,
    /// An internal invariant did not hold; fatal to the owning session.
    AssertionFailed,
    AddrParse,
    Io(io::ErrorKind),
}

impl WireError {
    #[inline]
    pub fn fatal(kind: ErrorType) -> WireError {
        WireError::Fatal(kind)
    }
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => WireError::Wait,
            kind => WireError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for WireError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        WireError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for WireResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(WireError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: WireError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, WireError::Wait);

        let err: WireError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(err, WireError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: WireError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, WireError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), WireError>(()).has_failed());
        assert!(!Err::<(), _>(WireError::Wait).has_failed());
        assert!(Err::<(), _>(WireError::Fatal(ErrorType::Timeout)).has_failed());
    }

    #[test]
    fn test_sized_cursor_accounting() {
        let mut backing = [0u8; 8];
        let mut write = io::Cursor::new(&mut backing[..]);
        assert_eq!(write.free_capacity(), 8);
        io::Write::write_all(&mut write, &[1, 2, 3]).unwrap();
        assert_eq!(write.free_capacity(), 5);

        let data = [1u8, 2, 3, 4];
        let mut read = io::Cursor::new(&data[..]);
        assert_eq!(read.remaining_data(), 4);
        let mut sink = [0u8; 3];
        io::Read::read_exact(&mut read, &mut sink).unwrap();
        assert_eq!(read.remaining_data(), 1);
    }
}
