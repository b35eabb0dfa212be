use bytes::{Buf, Bytes};
use thiserror::Error;

pub fn to_hex<T: AsRef<[u8]>>(data: T) -> String {
    array_bytes::bytes2hex("", data.as_ref())
}

/// Errors raised while decoding wire packets. Any of these causes the
/// offending packet to be dropped.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of packet")]
    UnexpectedEof,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("trailing bytes after message payload")]
    TrailingBytes,
}

pub(crate) type CodecResult<T> = Result<T, CodecError>;

pub(crate) fn read_u8(buf: &mut Bytes) -> CodecResult<u8> {
    if buf.remaining() < 1 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut Bytes) -> CodecResult<u16> {
    if buf.remaining() < 2 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn read_u32(buf: &mut Bytes) -> CodecResult<u32> {
    if buf.remaining() < 4 {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn read_array<const N: usize>(buf: &mut Bytes) -> CodecResult<[u8; N]> {
    if buf.remaining() < N {
        return Err(CodecError::UnexpectedEof);
    }
    let mut array = [0u8; N];
    buf.copy_to_slice(&mut array);
    Ok(array)
}

pub(crate) fn read_bytes(buf: &mut Bytes, len: usize) -> CodecResult<Bytes> {
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;

    #[test]
    fn test_read_primitives() {
        let mut encoded = BytesMut::new();
        encoded.put_u8(7);
        encoded.put_u16_le(513);
        encoded.put_u32_le(70_000);
        let mut buf = encoded.freeze();

        assert_eq!(Ok(7), read_u8(&mut buf));
        assert_eq!(Ok(513), read_u16(&mut buf));
        assert_eq!(Ok(70_000), read_u32(&mut buf));
        assert_eq!(Err(CodecError::UnexpectedEof), read_u8(&mut buf));
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut buf = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(Err(CodecError::UnexpectedEof), read_u32(&mut buf));

        let mut buf = Bytes::from_static(&[1, 2, 3]);
        assert!(read_array::<4>(&mut buf).is_err());
    }
}
