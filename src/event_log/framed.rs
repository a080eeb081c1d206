//! Length-prefixed frames: `[len: u8][payload; len]`.
use super::Frame;
use crate::error::LogError;
use crate::record::Event;
use std::io::{self, Read, Write};

/// Largest payload a one-byte length can describe.
pub const MAX_RECORD: usize = u8::MAX as usize;

/// Refuses payloads that do not fit the length byte before writing anything;
/// the inner result carries I/O failures.
pub(super) fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> Result<io::Result<()>, LogError> {
    let len = u8::try_from(payload.len()).map_err(|_| LogError::RecordTooLarge { size: payload.len(), limit: MAX_RECORD })?;
    Ok(w.write_all(&[len]).and_then(|_| w.write_all(payload)))
}

pub(super) fn read_record<R: Read>(r: &mut R) -> io::Result<Frame> {
    let mut len = [0u8; 1];
    r.read_exact(&mut len)?;
    let mut payload = vec![0u8; len[0] as usize];
    r.read_exact(&mut payload)?;
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Record(event),
        Err(e) => Frame::Corrupt(format!("bincode decode: {e}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_layout_is_length_then_payload() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"abc").unwrap().unwrap();
        assert_eq!(buf, vec![3, b'a', b'b', b'c']);
        assert!(write_record(&mut buf, &[0u8; MAX_RECORD]).is_ok());
        assert!(matches!(
            write_record(&mut Vec::new(), &[0u8; MAX_RECORD + 1]),
            Err(LogError::RecordTooLarge { size: 256, limit: MAX_RECORD })
        ));
    }

    #[test]
    fn garbage_payload_is_corrupt_not_fatal() {
        let mut r = Cursor::new(vec![2u8, 0xff, 0xff]);
        assert!(matches!(read_record(&mut r).unwrap(), Frame::Corrupt(_)));
        // The bad frame was consumed; nothing is left.
        assert_eq!(read_record(&mut r).err().map(|e| e.kind()), Some(io::ErrorKind::UnexpectedEof));
    }
}
