//! Self-describing container: `EVLG`, a header frame carrying the method
//! schema, then record frames `[len: u32 le][crc32: u32 le][payload]`.
use super::Frame;
use crate::error::LogError;
use crate::record::{Event, FieldKind, Method};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const MAGIC: &[u8; 4] = b"EVLG";
const VERSION: u16 = 1;

/// Largest frame payload written or read back.
pub const MAX_FRAME: usize = 16 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    version: u16,
    created_unix_ns: u128,
    schema: Vec<MethodSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MethodSchema {
    method: String,
    fields: Vec<(String, FieldKind)>,
}

fn current_schema() -> Vec<MethodSchema> {
    Method::ALL
        .iter()
        .map(|m| MethodSchema {
            method: m.name().to_string(),
            fields: m.schema().iter().map(|a| (a.name.to_string(), a.kind)).collect(),
        })
        .collect()
}

/// Callers keep `payload` within [`MAX_FRAME`].
fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let crc = hasher.finalize();
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(payload)
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Returns the payload and whether its checksum matched. A length over
/// [`MAX_FRAME`] cannot be resynchronised from and fails as `InvalidData`.
fn read_frame<R: Read>(r: &mut R) -> io::Result<(Vec<u8>, bool)> {
    let len = read_u32(r)? as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(ErrorKind::InvalidData, format!("frame length {len} over {MAX_FRAME} bytes")));
    }
    let crc_on_file = read_u32(r)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    Ok((payload, hasher.finalize() == crc_on_file))
}

pub(super) fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    let header = FileHeader {
        version: VERSION,
        created_unix_ns: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos(),
        schema: current_schema(),
    };
    let payload = bincode::serialize(&header).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    w.write_all(MAGIC)?;
    write_frame(w, &payload)
}

pub(super) fn read_header<R: Read>(r: &mut R, path: &Path) -> Result<(), LogError> {
    let bad = |reason: String| LogError::BadHeader { path: path.to_path_buf(), reason };
    let io_or_bad = |e: io::Error| match e.kind() {
        ErrorKind::UnexpectedEof => bad("file too short".to_string()),
        ErrorKind::InvalidData => bad(e.to_string()),
        _ => LogError::io(path, e),
    };

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(io_or_bad)?;
    if &magic != MAGIC {
        return Err(bad(format!("magic {magic:02x?}")));
    }
    let (payload, crc_ok) = read_frame(r).map_err(io_or_bad)?;
    if !crc_ok {
        return Err(bad("header checksum mismatch".to_string()));
    }
    let header: FileHeader = bincode::deserialize(&payload).map_err(|e| bad(format!("header decode: {e}")))?;
    if header.version != VERSION {
        return Err(bad(format!("unsupported version {}", header.version)));
    }
    // Methods this build does not know can only appear as undecodable
    // records, which are skipped. Known ones must agree on their fields.
    let ours = current_schema();
    for theirs in &header.schema {
        if let Some(mine) = ours.iter().find(|s| s.method == theirs.method) {
            if mine != theirs {
                return Err(bad(format!("schema of {} differs", theirs.method)));
            }
        }
    }
    Ok(())
}

/// Refuses payloads over [`MAX_FRAME`] before writing anything; the inner
/// result carries I/O failures.
pub(super) fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> Result<io::Result<()>, LogError> {
    if payload.len() > MAX_FRAME {
        return Err(LogError::RecordTooLarge { size: payload.len(), limit: MAX_FRAME });
    }
    Ok(write_frame(w, payload))
}

/// Decode one record payload. An empty payload decodes to nothing.
fn decode(payload: &[u8]) -> Result<Option<Event>, bincode::Error> {
    if payload.is_empty() {
        return Ok(None);
    }
    bincode::deserialize(payload).map(Some)
}

pub(super) fn read_record<R: Read>(r: &mut R) -> io::Result<Frame> {
    let (payload, crc_ok) = read_frame(r)?;
    if !crc_ok {
        return Ok(Frame::Corrupt("checksum mismatch".to_string()));
    }
    Ok(match decode(&payload) {
        Ok(Some(event)) => Frame::Record(event),
        Ok(None) => Frame::Empty,
        Err(e) => Frame::Corrupt(format!("bincode decode: {e}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn event() -> Event {
        Event::new(Method::TickSize, "c", 9, vec![1.into(), 2.into(), 3.into()]).unwrap()
    }

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(&buf[..4], MAGIC);
        read_header(&mut Cursor::new(buf), Path::new("x.evl")).unwrap();
    }

    #[test]
    fn foreign_files_are_rejected() {
        let err = read_header(&mut Cursor::new(b"PK\x03\x04rest".to_vec()), Path::new("x.evl")).unwrap_err();
        assert!(matches!(err, LogError::BadHeader { .. }));
        let err = read_header(&mut Cursor::new(b"EV".to_vec()), Path::new("x.evl")).unwrap_err();
        assert!(matches!(err, LogError::BadHeader { .. }));
    }

    #[test]
    fn checksum_mismatch_skips_only_that_record() {
        let mut buf = Vec::new();
        let payload = bincode::serialize(&event()).unwrap();
        write_record(&mut buf, &payload).unwrap().unwrap();
        let flip = buf.len() - 1;
        buf[flip] ^= 0xff;
        write_record(&mut buf, &payload).unwrap().unwrap();

        let mut r = Cursor::new(buf);
        assert!(matches!(read_record(&mut r).unwrap(), Frame::Corrupt(_)));
        assert!(matches!(read_record(&mut r).unwrap(), Frame::Record(e) if e == event()));
        assert_eq!(read_record(&mut r).err().map(|e| e.kind()), Some(ErrorKind::UnexpectedEof));
    }

    #[test]
    fn absurd_length_fails_without_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(b"short");
        let err = read_record(&mut Cursor::new(buf.clone())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let mut header = MAGIC.to_vec();
        header.extend_from_slice(&buf);
        let err = read_header(&mut Cursor::new(header), Path::new("x.evl")).unwrap_err();
        assert!(matches!(err, LogError::BadHeader { .. }));
    }

    #[test]
    fn oversized_payload_is_refused_before_writing() {
        let mut buf = Vec::new();
        let err = write_record(&mut buf, &vec![0u8; MAX_FRAME + 1]).unwrap_err();
        assert!(matches!(err, LogError::RecordTooLarge { limit: MAX_FRAME, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame_decodes_to_nothing() {
        let mut buf = Vec::new();
        write_record(&mut buf, &[]).unwrap().unwrap();
        assert!(matches!(read_record(&mut Cursor::new(buf)).unwrap(), Frame::Empty));
    }
}
